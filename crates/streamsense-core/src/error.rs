//! Error taxonomy for the ingestion core.
//!
//! Component errors stay typed all the way up. The pipeline folds them into
//! [`ProcessingError`], which is the only thing the consumer looks at when it
//! decides between ack, retry and dead-letter.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A reading that can never be processed, no matter how often it is redelivered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    MalformedPayload(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Failure while appending to the result store.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Failure talking to the queue collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("unknown or expired lease {0}")]
    UnknownLease(String),

    #[error("queue is closed")]
    Closed,

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Model artifact could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact `{0}` not found")]
    Missing(String),

    #[error("model artifact `{name}` is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("model artifact `{name}` expects {found} features, scorer supplies {expected}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("model store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retryable processing failure.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Covers slow scoring as well: the scorer itself cannot fail.
    #[error("processing exceeded {0:?}")]
    Timeout(Duration),
}

/// Classified outcome of a failed `handle()` call.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("transient failure: {0}")]
    Transient(#[from] TransientError),
}

impl ProcessingError {
    /// Fatal errors skip retry and go straight to dead-letter.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<SinkError> for ProcessingError {
    fn from(err: SinkError) -> Self {
        Self::Transient(TransientError::Sink(err))
    }
}

/// Configuration rejected by [`crate::config::PipelineConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
