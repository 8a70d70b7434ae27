//! # streamsense-core
//!
//! **At-least-once anomaly scoring for streamed sensor readings.**
//!
//! `streamsense-core` consumes device readings (temperature and vibration)
//! from a durable queue, enriches each with rolling per-device statistics,
//! scores it with two independently trained models, and persists the result
//! before acknowledging the message.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamsense_core::{
//!     AnomalyScorer, Consumer, ConsumerConfig, DirModelStore, FeatureWindows, InMemoryQueue,
//!     IngestionPipeline, PartitionedFileSink,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scorer = AnomalyScorer::load(&DirModelStore::new("models"))?;
//! let sink = Arc::new(PartitionedFileSink::new("warehouse"));
//! let pipeline = Arc::new(IngestionPipeline::new(FeatureWindows::default(), scorer, sink));
//!
//! let queue = Arc::new(InMemoryQueue::default());
//! queue.publish(br#"{"device_id":"d1","timestamp":"2024-01-01T00:00:00Z","temperature":21.5,"vibration":1.1}"#.to_vec());
//!
//! let shutdown = CancellationToken::new();
//! Consumer::new(queue, pipeline, ConsumerConfig::default()).run(shutdown).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Queue → Consumer → Pipeline (Feature Window → Scorer → Sink) → ack
//!
//! - A reading's features are computed from the window *before* the reading
//!   is folded in.
//! - A message is acked only after the sink confirmed the write. Transient
//!   failures are nacked and redelivered with backoff; validation failures
//!   and exhausted retries go to the dead-letter destination.
//! - Readings for one device are processed in delivery order.

pub mod alert;
pub mod config;
pub mod consumer;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod reading;
pub mod scorer;
pub mod sink;
pub mod stats;
pub mod window;

pub use alert::{Alert, Severity};
pub use config::PipelineConfig;
pub use consumer::{
    Consumer, ConsumerConfig, DeliveryAttempt, DeliveryTracker, Disposition, decide,
};
pub use error::{
    ConfigError, ModelError, ProcessingError, QueueError, SinkError, TransientError,
    ValidationError,
};
pub use model::{
    AnomalyModel, Bound, DirModelStore, EnvelopeModel, IsolationForest, IsolationTree,
    ModelArtifact, ModelStore, ModelSummary, Prediction, StandardScaler,
};
pub use pipeline::IngestionPipeline;
pub use queue::{AckHandle, BackoffPolicy, DeadLetter, Delivery, InMemoryQueue, MessageQueue};
pub use reading::Reading;
pub use scorer::{AnomalyResult, AnomalyScorer, Dimension, DimensionResult};
pub use sink::{MemorySink, PartitionKey, PartitionedFileSink, ResultSink, ScoredRecord};
pub use stats::{PipelineStats, StatsSnapshot};
pub use window::{FeatureVector, FeatureWindows, WindowSnapshot};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
