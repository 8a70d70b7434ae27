//! Dual-model anomaly scoring.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::{AnomalyModel, ModelArtifact, ModelStore, ModelSummary};
use crate::window::FeatureVector;

/// Columns each model is fitted on.
pub const MODEL_FEATURES: usize = 5;

/// Artifact names in model storage.
pub const TEMPERATURE_MODEL: &str = "temperature";
pub const VIBRATION_MODEL: &str = "vibration";

/// Scored reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_version: String,
    pub temp_anomaly_score: f64,
    pub vibration_anomaly_score: f64,
    pub is_temp_anomaly: bool,
    pub is_vibration_anomaly: bool,
    pub overall_anomaly: bool,
}

/// Which model a single-dimension request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Temperature,
    Vibration,
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Vibration => write!(f, "vibration"),
        }
    }
}

/// Result of scoring one dimension only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionResult {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub dimension: Dimension,
    pub value: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub model_version: String,
}

/// Temperature and vibration models behind one scoring call.
///
/// Cheap to clone; the models are shared read-only.
#[derive(Clone)]
pub struct AnomalyScorer {
    temperature: Arc<dyn AnomalyModel>,
    vibration: Arc<dyn AnomalyModel>,
    version: Arc<str>,
}

impl AnomalyScorer {
    pub fn new(
        temperature: Arc<dyn AnomalyModel>,
        vibration: Arc<dyn AnomalyModel>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            temperature,
            vibration,
            version: Arc::from(version.into()),
        }
    }

    /// Fetch, decode and check both artifacts. Any failure is fatal.
    pub fn load(store: &dyn ModelStore) -> Result<Self, ModelError> {
        let version = store.version()?;
        let temperature = load_artifact(store, TEMPERATURE_MODEL)?;
        let vibration = load_artifact(store, VIBRATION_MODEL)?;
        log::info!(
            "loaded models version={version} temperature={} vibration={}",
            temperature.kind(),
            vibration.kind()
        );
        Ok(Self::new(Arc::new(temperature), Arc::new(vibration), version))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Score both dimensions. Flags combine by OR; scores stay separate.
    pub fn score(&self, features: &FeatureVector) -> AnomalyResult {
        let temp = self.temperature.predict(&features.temperature_inputs());
        let vib = self.vibration.predict(&features.vibration_inputs());
        AnomalyResult {
            device_id: features.device_id.clone(),
            timestamp: features.timestamp,
            model_version: self.version.to_string(),
            temp_anomaly_score: temp.score,
            vibration_anomaly_score: vib.score,
            is_temp_anomaly: temp.is_anomaly,
            is_vibration_anomaly: vib.is_anomaly,
            overall_anomaly: temp.is_anomaly || vib.is_anomaly,
        }
    }

    pub fn score_temperature(&self, features: &FeatureVector) -> DimensionResult {
        self.score_dimension(features, Dimension::Temperature)
    }

    pub fn score_vibration(&self, features: &FeatureVector) -> DimensionResult {
        self.score_dimension(features, Dimension::Vibration)
    }

    pub fn score_dimension(&self, features: &FeatureVector, dimension: Dimension) -> DimensionResult {
        let (prediction, value) = match dimension {
            Dimension::Temperature => (
                self.temperature.predict(&features.temperature_inputs()),
                features.temperature,
            ),
            Dimension::Vibration => (
                self.vibration.predict(&features.vibration_inputs()),
                features.vibration,
            ),
        };
        DimensionResult {
            device_id: features.device_id.clone(),
            timestamp: features.timestamp,
            dimension,
            value,
            anomaly_score: prediction.score,
            is_anomaly: prediction.is_anomaly,
            model_version: self.version.to_string(),
        }
    }
}

impl std::fmt::Debug for AnomalyScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyScorer")
            .field("temperature", &self.temperature.kind())
            .field("vibration", &self.vibration.kind())
            .field("version", &self.version)
            .finish()
    }
}

/// Fetch and decode one artifact, checking its input width.
pub fn load_artifact(store: &dyn ModelStore, name: &str) -> Result<ModelArtifact, ModelError> {
    let bytes = store.fetch(name)?;
    let artifact = ModelArtifact::from_slice(name, &bytes)?;
    let found = artifact.n_features();
    if found != MODEL_FEATURES {
        return Err(ModelError::Arity {
            name: name.to_string(),
            expected: MODEL_FEATURES,
            found,
        });
    }
    Ok(artifact)
}

/// Summaries of both artifacts in a store, for inspection tools.
pub fn describe_store(store: &dyn ModelStore) -> Result<Vec<(String, ModelSummary)>, ModelError> {
    [TEMPERATURE_MODEL, VIBRATION_MODEL]
        .into_iter()
        .map(|name| load_artifact(store, name).map(|a| (name.to_string(), a.summary())))
        .collect()
}
