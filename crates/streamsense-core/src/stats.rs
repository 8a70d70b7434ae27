//! Pipeline counters.
//!
//! Plain relaxed atomics; a [`StatsSnapshot`] is a point-in-time copy that can
//! be serialized for `/stats` or printed at exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scorer::AnomalyResult;

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    validation_failures: AtomicU64,
    anomalies: AtomicU64,
    temp_anomalies: AtomicU64,
    vibration_anomalies: AtomicU64,
    scored: AtomicU64,
    scoring_micros_total: AtomicU64,
    scoring_micros_max: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub validation_failures: u64,
    pub anomalies: u64,
    pub temp_anomalies: u64,
    pub vibration_anomalies: u64,
    /// Feature extraction plus scoring, per reading.
    pub scored: u64,
    pub scoring_micros_total: u64,
    pub scoring_micros_max: u64,
}

impl StatsSnapshot {
    pub fn mean_scoring_micros(&self) -> Option<f64> {
        (self.scored > 0).then(|| self.scoring_micros_total as f64 / self.scored as f64)
    }
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the flags of one scored reading.
    pub fn record_result(&self, result: &AnomalyResult) {
        if result.overall_anomaly {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_temp_anomaly {
            self.temp_anomalies.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_vibration_anomaly {
            self.vibration_anomalies.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time spent turning one reading into an [`AnomalyResult`].
    pub fn record_scoring(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.scored.fetch_add(1, Ordering::Relaxed);
        self.scoring_micros_total.fetch_add(micros, Ordering::Relaxed);
        self.scoring_micros_max.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            temp_anomalies: self.temp_anomalies.load(Ordering::Relaxed),
            vibration_anomalies: self.vibration_anomalies.load(Ordering::Relaxed),
            scored: self.scored.load(Ordering::Relaxed),
            scoring_micros_total: self.scoring_micros_total.load(Ordering::Relaxed),
            scoring_micros_max: self.scoring_micros_max.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "received:            {}", self.received)?;
        writeln!(f, "acked:               {}", self.acked)?;
        writeln!(f, "retried:             {}", self.retried)?;
        writeln!(f, "dead-lettered:       {}", self.dead_lettered)?;
        writeln!(f, "validation failures: {}", self.validation_failures)?;
        writeln!(
            f,
            "anomalies:           {} (temperature {}, vibration {})",
            self.anomalies, self.temp_anomalies, self.vibration_anomalies
        )?;
        match self.mean_scoring_micros() {
            Some(mean) => writeln!(
                f,
                "scoring latency:     mean {mean:.1}us, max {}us over {} reading(s)",
                self.scoring_micros_max, self.scored
            ),
            None => writeln!(f, "scoring latency:     -"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(temp: bool, vib: bool) -> AnomalyResult {
        AnomalyResult {
            device_id: "d".into(),
            timestamp: Utc::now(),
            model_version: "v".into(),
            temp_anomaly_score: 0.0,
            vibration_anomaly_score: 0.0,
            is_temp_anomaly: temp,
            is_vibration_anomaly: vib,
            overall_anomaly: temp || vib,
        }
    }

    #[test]
    fn counts_flags() {
        let stats = PipelineStats::new();
        stats.record_result(&result(true, true));
        stats.record_result(&result(false, true));
        stats.record_result(&result(false, false));
        let snap = stats.snapshot();
        assert_eq!(snap.anomalies, 2);
        assert_eq!(snap.temp_anomalies, 1);
        assert_eq!(snap.vibration_anomalies, 2);
    }

    #[test]
    fn tracks_scoring_latency() {
        let stats = PipelineStats::new();
        assert_eq!(stats.snapshot().mean_scoring_micros(), None);
        stats.record_scoring(Duration::from_micros(100));
        stats.record_scoring(Duration::from_micros(300));
        let snap = stats.snapshot();
        assert_eq!(snap.scored, 2);
        assert_eq!(snap.scoring_micros_max, 300);
        assert_eq!(snap.mean_scoring_micros(), Some(200.0));
        assert!(snap.to_string().contains("max 300us over 2 reading(s)"));
    }

    #[test]
    fn snapshot_serializes() {
        let stats = PipelineStats::new();
        stats.record_received();
        stats.record_acked();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["received"], 1);
        assert_eq!(json["acked"], 1);
        assert_eq!(json["dead_lettered"], 0);
    }
}
