pub mod inspect_model;
pub mod run;
pub mod serve;
pub mod simulate;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use streamsense_core::{InMemoryQueue, PipelineConfig};
use tokio_util::sync::CancellationToken;

/// Pipeline overrides shared by `run` and `serve`.
#[derive(clap::Args, Debug, Default)]
pub struct Tuning {
    /// Worker tasks
    #[arg(long)]
    pub workers: Option<usize>,

    /// Readings kept per device window
    #[arg(long)]
    pub window: Option<usize>,

    /// Delivery attempts before a message is dead-lettered
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Per-message processing timeout in seconds
    #[arg(long)]
    pub processing_timeout: Option<f64>,
}

impl Tuning {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if let Some(n) = self.window {
            config.window_capacity = n;
        }
        if let Some(n) = self.max_attempts {
            config.max_delivery_attempts = n;
        }
        if let Some(secs) = self.processing_timeout {
            config.processing_timeout_secs = secs;
        }
    }
}

/// Defaults, then the config file, then flags.
pub fn load_config(path: Option<&Path>, tuning: &Tuning) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(p) => PipelineConfig::load(p)
            .with_context(|| format!("loading config from {}", p.display()))?,
        None => PipelineConfig::default(),
    };
    tuning.apply(&mut config);
    config.validate().context("invalid pipeline settings")?;
    Ok(config)
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("starting tokio runtime")
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, shutting down");
            token.cancel();
        }
    });
}

/// Publish every non-blank line of a JSONL file (or stdin for `-`).
pub fn publish_lines(queue: &InMemoryQueue, input: &Path) -> Result<usize> {
    let reader: Box<dyn BufRead> = if input == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file =
            File::open(input).with_context(|| format!("opening {}", input.display()))?;
        Box::new(BufReader::new(file))
    };
    let mut published = 0;
    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        queue.publish(line.into_bytes());
        published += 1;
    }
    Ok(published)
}
