//! Observe → score → persist for one reading.
//!
//! The pipeline never acks or retries; it returns a classified
//! [`ProcessingError`] and leaves the decision to the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::alert::Alert;
use crate::error::ProcessingError;
use crate::reading::Reading;
use crate::scorer::{AnomalyResult, AnomalyScorer};
use crate::sink::{ResultSink, ScoredRecord};
use crate::stats::PipelineStats;
use crate::window::FeatureWindows;

pub struct IngestionPipeline {
    windows: FeatureWindows,
    scorer: AnomalyScorer,
    sink: Arc<dyn ResultSink>,
    device_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stats: Arc<PipelineStats>,
}

impl IngestionPipeline {
    pub fn new(windows: FeatureWindows, scorer: AnomalyScorer, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            windows,
            scorer,
            sink,
            device_locks: Mutex::new(HashMap::new()),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Share counters with another component, e.g. the HTTP server.
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn scorer(&self) -> &AnomalyScorer {
        &self.scorer
    }

    pub fn windows(&self) -> &FeatureWindows {
        &self.windows
    }

    /// Decode a queue payload and process it.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<AnomalyResult, ProcessingError> {
        let reading = Reading::from_slice(payload)?;
        self.handle(reading).await
    }

    /// Process one validated reading. Returns only after the sink confirmed
    /// the write.
    ///
    /// Calls for the same device are serialized for the whole duration, so
    /// window updates and appends for one device never interleave. A failed
    /// call leaves the device window untouched.
    pub async fn handle(&self, reading: Reading) -> Result<AnomalyResult, ProcessingError> {
        let lock = self.device_lock(&reading.device_id);
        let _guard = lock.lock().await;

        // The window only keeps readings whose record reached the sink, so a
        // redelivered reading is never scored against itself.
        let started = Instant::now();
        let features = self.windows.peek(&reading.device_id, &reading);
        let result = self.scorer.score(&features);
        self.stats.record_scoring(started.elapsed());
        let record = ScoredRecord::new(&reading, &features, &result);
        self.sink.append(&record).await?;
        self.windows.commit(&reading.device_id, &reading);

        self.stats.record_result(&result);
        if let Some(alert) = Alert::from_result(&result, reading.temperature, reading.vibration) {
            alert.log();
        }
        log::debug!(
            "scored {} at {}: temp={:.4} vib={:.4}",
            result.device_id,
            result.timestamp,
            result.temp_anomaly_score,
            result.vibration_anomaly_score
        );
        Ok(result)
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .device_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }
}
