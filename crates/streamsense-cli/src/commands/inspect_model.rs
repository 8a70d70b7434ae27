use std::path::Path;

use anyhow::{Context, Result};
use streamsense_core::{DirModelStore, ModelStore, scorer::describe_store};

pub fn run(models: &Path, json: bool) -> Result<()> {
    let store = DirModelStore::new(models);
    let version = store.version().context("reading model version")?;
    let summaries = describe_store(&store)
        .with_context(|| format!("inspecting models in {}", models.display()))?;

    if json {
        let mut artifacts = serde_json::Map::new();
        for (name, summary) in &summaries {
            artifacts.insert(name.clone(), serde_json::to_value(summary)?);
        }
        let out = serde_json::json!({
            "dir": models.display().to_string(),
            "version": version,
            "artifacts": artifacts,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Models in {} (version {version})", models.display());
    println!();
    println!(
        "  {:<12} {:<18} {:>8} {:>6} {:>11} {:>10}",
        "Artifact", "Kind", "Features", "Trees", "MaxSamples", "Offset"
    );
    println!("  {}", "-".repeat(70));
    for (name, s) in &summaries {
        let dash = || "-".to_string();
        println!(
            "  {:<12} {:<18} {:>8} {:>6} {:>11} {:>10}",
            name,
            s.kind,
            s.n_features,
            s.n_trees.map_or_else(dash, |n| n.to_string()),
            s.max_samples.map_or_else(dash, |n| n.to_string()),
            s.offset.map_or_else(dash, |o| format!("{o:.4}")),
        );
    }
    Ok(())
}
