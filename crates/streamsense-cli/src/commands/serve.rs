use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use streamsense_core::{
    AnomalyScorer, Consumer, ConsumerConfig, DirModelStore, FeatureWindows, InMemoryQueue,
    IngestionPipeline, PartitionedFileSink, PipelineConfig, PipelineStats,
};
use streamsense_server::{AppState, run_server};
use tokio_util::sync::CancellationToken;

pub struct ServeCommandConfig<'a> {
    pub host: &'a str,
    pub port: u16,
    pub models: &'a Path,
    pub input: Option<&'a Path>,
    pub output: &'a Path,
    pub config: PipelineConfig,
}

pub fn run(cfg: ServeCommandConfig<'_>) -> Result<()> {
    let scorer = match AnomalyScorer::load(&DirModelStore::new(cfg.models)) {
        Ok(scorer) => Some(scorer),
        Err(err) => {
            log::error!("models unavailable, serving degraded: {err}");
            None
        }
    };

    let base = format!("http://{}:{}", cfg.host, cfg.port);
    println!("StreamSense Server v{}", streamsense_core::VERSION);
    println!("   {base}");
    match &scorer {
        Some(s) => println!("   models: {} ({})", cfg.models.display(), s.version()),
        None => println!("   models: NOT LOADED (scoring endpoints return 503)"),
    }
    println!();
    println!("   Endpoints:");
    println!("     GET  /                    API index");
    println!("     POST /detect              Score temperature and vibration");
    println!("     POST /detect/temperature  Score temperature only");
    println!("     POST /detect/vibration    Score vibration only");
    println!("     POST /alert               Raise an operator alert");
    println!("     GET  /stats               Counters");
    println!("     GET  /health              Health check");
    println!();
    println!("   Example:");
    println!(
        "     curl -X POST {base}/detect -d '{{\"device_id\":\"d1\",\"temperature\":35.0,\"vibration\":1.5}}'"
    );
    println!();

    let rt = super::runtime()?;
    rt.block_on(serve(cfg, scorer))
}

async fn serve(cfg: ServeCommandConfig<'_>, scorer: Option<AnomalyScorer>) -> Result<()> {
    let config = &cfg.config;
    let shutdown = CancellationToken::new();
    super::cancel_on_ctrl_c(shutdown.clone());

    let stats = Arc::new(PipelineStats::new());
    let mut state = AppState::new(
        scorer.clone(),
        FeatureWindows::new(config.window_capacity, config.window_shards),
    )
    .with_stats(Arc::clone(&stats));

    let mut consumer_task = None;
    if let Some(input) = cfg.input {
        match scorer {
            Some(scorer) => {
                let queue = Arc::new(InMemoryQueue::new(config.ack_deadline(), config.backoff));
                let published = super::publish_lines(&queue, input)?;
                log::info!("queued {published} message(s) from {}", input.display());
                let pipeline = IngestionPipeline::new(
                    FeatureWindows::new(config.window_capacity, config.window_shards),
                    scorer,
                    Arc::new(PartitionedFileSink::new(cfg.output)),
                )
                .with_stats(Arc::clone(&stats));
                state = state.with_queue(queue.clone());
                let consumer = Consumer::new(queue, Arc::new(pipeline), ConsumerConfig::from(config));
                consumer_task = Some(tokio::spawn(consumer.run(shutdown.clone())));
            }
            None => log::warn!("not consuming {}: models are not loaded", input.display()),
        }
    }

    let token = shutdown.clone();
    let served = run_server(state, cfg.host, cfg.port, async move {
        token.cancelled().await;
    })
    .await
    .with_context(|| format!("serving on {}:{}", cfg.host, cfg.port));

    shutdown.cancel();
    if let Some(task) = consumer_task {
        task.await.context("consumer task failed")?;
    }
    served
}
