use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use streamsense_core::{
    AnomalyScorer, Consumer, ConsumerConfig, DeadLetter, DirModelStore, FeatureWindows,
    InMemoryQueue, IngestionPipeline, PartitionedFileSink, PipelineConfig, StatsSnapshot,
};
use tokio_util::sync::CancellationToken;

pub struct RunCommandConfig<'a> {
    pub input: &'a Path,
    pub models: &'a Path,
    pub output: &'a Path,
    pub dead_letters: Option<&'a Path>,
    pub config: PipelineConfig,
}

pub fn run(cfg: RunCommandConfig<'_>) -> Result<()> {
    let scorer = AnomalyScorer::load(&DirModelStore::new(cfg.models))
        .with_context(|| format!("loading models from {}", cfg.models.display()))?;

    println!("StreamSense v{}", streamsense_core::VERSION);
    println!("   models:    {} ({})", cfg.models.display(), scorer.version());
    println!("   input:     {}", cfg.input.display());
    println!("   warehouse: {}", cfg.output.display());
    println!(
        "   workers:   {}, window {}, max attempts {}",
        cfg.config.workers, cfg.config.window_capacity, cfg.config.max_delivery_attempts
    );
    println!();

    let rt = super::runtime()?;
    let (stats, dead) = rt.block_on(consume(&cfg, scorer))?;

    if let Some(path) = cfg.dead_letters {
        write_dead_letters(path, &dead)?;
        println!("   {} dead letter(s) written to {}", dead.len(), path.display());
    } else if !dead.is_empty() {
        println!("   {} dead letter(s) (use --dead-letters to keep them)", dead.len());
    }
    println!();
    print!("{stats}");
    Ok(())
}

async fn consume(
    cfg: &RunCommandConfig<'_>,
    scorer: AnomalyScorer,
) -> Result<(StatsSnapshot, Vec<DeadLetter>)> {
    let config = &cfg.config;
    let queue = Arc::new(InMemoryQueue::new(config.ack_deadline(), config.backoff));
    let published = super::publish_lines(&queue, cfg.input)?;
    log::info!("queued {published} message(s)");

    let pipeline = Arc::new(IngestionPipeline::new(
        FeatureWindows::new(config.window_capacity, config.window_shards),
        scorer,
        Arc::new(PartitionedFileSink::new(cfg.output)),
    ));

    let shutdown = CancellationToken::new();
    super::cancel_on_ctrl_c(shutdown.clone());
    let consumer = Consumer::new(
        queue.clone(),
        Arc::clone(&pipeline),
        ConsumerConfig::from(config),
    );
    let task = tokio::spawn(consumer.run(shutdown.clone()));

    while !queue.is_drained() && !shutdown.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();
    task.await.context("consumer task failed")?;

    let remaining = queue.pending_count();
    if remaining > 0 {
        log::warn!("{remaining} message(s) left unprocessed");
    }
    Ok((pipeline.stats().snapshot(), queue.dead_letters()))
}

fn write_dead_letters(path: &Path, letters: &[DeadLetter]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for letter in letters {
        serde_json::to_writer(&mut out, letter)?;
        out.write_all(b"\n")?;
    }
    out.flush()
        .with_context(|| format!("writing {}", path.display()))
}
