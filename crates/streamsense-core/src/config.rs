//! Runtime configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides. The CLI layers its flags on top of whatever is loaded here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::BackoffPolicy;
use crate::window::{DEFAULT_SHARDS, DEFAULT_WINDOW_CAPACITY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Readings kept per device window.
    pub window_capacity: usize,
    /// Mutex shards backing the window map.
    pub window_shards: usize,
    /// Concurrent worker tasks.
    pub workers: usize,
    /// Bounded channel depth per worker.
    pub worker_buffer: usize,
    pub max_delivery_attempts: u32,
    pub processing_timeout_secs: f64,
    pub shutdown_grace_secs: f64,
    pub ack_deadline_secs: f64,
    /// How long one `pull` waits before the dispatcher re-checks for shutdown.
    pub pull_timeout_secs: f64,
    pub backoff: BackoffPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            window_shards: DEFAULT_SHARDS,
            workers: 4,
            worker_buffer: 8,
            max_delivery_attempts: 5,
            processing_timeout_secs: 30.0,
            shutdown_grace_secs: 10.0,
            ack_deadline_secs: 60.0,
            pull_timeout_secs: 1.0,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("window_capacity", self.window_capacity),
            ("window_shards", self.window_shards),
            ("workers", self.workers),
            ("worker_buffer", self.worker_buffer),
            ("max_delivery_attempts", self.max_delivery_attempts as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        let durations = [
            ("processing_timeout_secs", self.processing_timeout_secs),
            ("shutdown_grace_secs", self.shutdown_grace_secs),
            ("ack_deadline_secs", self.ack_deadline_secs),
            ("pull_timeout_secs", self.pull_timeout_secs),
            ("backoff.minimum_secs", self.backoff.minimum_secs),
            ("backoff.maximum_secs", self.backoff.maximum_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }

        if self.ack_deadline_secs <= self.processing_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "ack_deadline_secs ({}s) must exceed processing_timeout_secs ({}s), \
                 or leases expire while messages are still being handled",
                self.ack_deadline_secs, self.processing_timeout_secs
            )));
        }
        if self.backoff.minimum_secs > self.backoff.maximum_secs {
            return Err(ConfigError::Invalid(format!(
                "backoff minimum ({}s) exceeds maximum ({}s)",
                self.backoff.minimum_secs, self.backoff.maximum_secs
            )));
        }
        if !self.backoff.multiplier.is_finite() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be >= 1, got {}",
                self.backoff.multiplier
            )));
        }
        Ok(())
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.processing_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_secs)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.ack_deadline_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pull_timeout_secs)
    }
}
