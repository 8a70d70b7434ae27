//! Pre-trained anomaly model artifacts.
//!
//! Training happens offline. This module only evaluates exported artifacts,
//! which are JSON documents tagged by `kind`:
//!
//! - `isolation_forest`: a fitted standard scaler plus the forest's trees as
//!   flat node arrays. Scoring follows the usual isolation-forest decision
//!   function `-2^(-E[h(x)] / c(max_samples)) - offset`. Negative means anomalous.
//! - `envelope`: per-feature lower/upper bounds. The score is the smallest signed
//!   margin to a bound, negative outside the envelope.
//!
//! Thresholds live in the artifact, never in code.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Euler–Mascheroni constant.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Result of scoring one feature row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Decision score. Lower is more anomalous; the boundary sits at zero.
    pub score: f64,
    pub is_anomaly: bool,
}

impl Prediction {
    pub fn from_score(score: f64) -> Self {
        Self {
            score,
            is_anomaly: score < 0.0,
        }
    }
}

/// Scoring capability of a loaded model. Implementations are immutable.
pub trait AnomalyModel: Send + Sync {
    /// Score one row. Never fails on a row of the right arity.
    fn predict(&self, features: &[f64]) -> Prediction;

    /// Number of input columns the model was fitted on.
    fn n_features(&self) -> usize;

    /// Short model family name.
    fn kind(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Standard scaler
// ---------------------------------------------------------------------------

/// Per-column `(x - mean) / scale` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| {
                // Zero-variance columns are fitted with unit scale.
                let s = if s.abs() < f64::EPSILON { 1.0 } else { *s };
                (x - m) / s
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Isolation forest
// ---------------------------------------------------------------------------

/// One isolation tree as parallel node arrays. A node is a leaf when its
/// left child is `-1`. Rows go left when `x[feature] <= threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationTree {
    pub children_left: Vec<i64>,
    pub children_right: Vec<i64>,
    pub feature: Vec<i64>,
    pub threshold: Vec<f64>,
    pub n_node_samples: Vec<u64>,
    /// Input columns seen by this tree, when it was fitted on a column subset
    /// or permutation. Tree-local feature `i` reads input column `features[i]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<usize>>,
}

impl IsolationTree {
    fn node_count(&self) -> usize {
        self.children_left.len()
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        let n = self.node_count();
        if n == 0 {
            return Err("tree has no nodes".into());
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.n_node_samples.len(),
        ]
        .iter()
        .any(|&len| len != n)
        {
            return Err("node arrays differ in length".into());
        }
        let local_features = match &self.features {
            Some(cols) => {
                if let Some(bad) = cols.iter().find(|&&c| c >= n_features) {
                    return Err(format!("feature column {bad} out of range"));
                }
                cols.len()
            }
            None => n_features,
        };
        for i in 0..n {
            let (l, r) = (self.children_left[i], self.children_right[i]);
            if l == -1 {
                continue;
            }
            // Children always follow their parent, which also rules out cycles.
            for child in [l, r] {
                if child <= i as i64 || child >= n as i64 {
                    return Err(format!("node {i} has invalid child {child}"));
                }
            }
            let f = self.feature[i];
            if f < 0 || f as usize >= local_features {
                return Err(format!("node {i} splits on invalid feature {f}"));
            }
        }
        Ok(())
    }

    /// Edges from the root to the leaf reached by `row`, plus the expected
    /// remaining depth for the samples left in that leaf.
    pub fn path_length(&self, row: &[f64]) -> f64 {
        let mut node = 0usize;
        let mut depth = 0.0;
        loop {
            let left = self.children_left[node];
            if left == -1 {
                return depth + average_path_length(self.n_node_samples[node]);
            }
            let local = self.feature[node] as usize;
            let col = match &self.features {
                Some(cols) => cols[local],
                None => local,
            };
            node = if row[col] <= self.threshold[node] {
                left as usize
            } else {
                self.children_right[node] as usize
            };
            depth += 1.0;
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` samples.
pub fn average_path_length(n: u64) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Exported isolation forest with its input scaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    pub n_features: usize,
    pub scaler: StandardScaler,
    pub max_samples: u64,
    /// Decision offset fitted from the contamination rate.
    pub offset: f64,
    pub trees: Vec<IsolationTree>,
}

impl IsolationForest {
    /// Raw anomaly score in `[-1, 0)`; more negative is more anomalous.
    pub fn score_samples(&self, row: &[f64]) -> f64 {
        let scaled = self.scaler.transform(row);
        let mean_depth = self
            .trees
            .iter()
            .map(|t| t.path_length(&scaled))
            .sum::<f64>()
            / self.trees.len() as f64;
        -(2f64).powf(-mean_depth / average_path_length(self.max_samples))
    }

    fn validate(&self) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".into());
        }
        if self.max_samples < 2 {
            return Err("max_samples must be at least 2".into());
        }
        if self.scaler.mean.len() != self.n_features || self.scaler.scale.len() != self.n_features
        {
            return Err("scaler width does not match n_features".into());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.n_features)
                .map_err(|e| format!("tree {i}: {e}"))?;
        }
        Ok(())
    }
}

impl AnomalyModel for IsolationForest {
    fn predict(&self, features: &[f64]) -> Prediction {
        Prediction::from_score(self.score_samples(features) - self.offset)
    }

    fn n_features(&self) -> usize {
        self.n_features
    }

    fn kind(&self) -> &'static str {
        "isolation_forest"
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Allowed range for one column. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

/// Rule-based model: a row is normal while every column sits inside its bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeModel {
    pub bounds: Vec<Bound>,
}

impl EnvelopeModel {
    fn validate(&self) -> Result<(), String> {
        if self
            .bounds
            .iter()
            .all(|b| b.lower.is_none() && b.upper.is_none())
        {
            return Err("envelope has no bounds".into());
        }
        if let Some((i, _)) = self
            .bounds
            .iter()
            .enumerate()
            .find(|(_, b)| matches!((b.lower, b.upper), (Some(l), Some(u)) if l > u))
        {
            return Err(format!("bound {i} has lower > upper"));
        }
        Ok(())
    }
}

impl AnomalyModel for EnvelopeModel {
    fn predict(&self, features: &[f64]) -> Prediction {
        let score = self
            .bounds
            .iter()
            .zip(features)
            .flat_map(|(b, x)| [b.lower.map(|l| x - l), b.upper.map(|u| u - x)])
            .flatten()
            .fold(f64::MAX, f64::min);
        Prediction::from_score(score)
    }

    fn n_features(&self) -> usize {
        self.bounds.len()
    }

    fn kind(&self) -> &'static str {
        "envelope"
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// A model artifact as stored in model storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    IsolationForest(IsolationForest),
    Envelope(EnvelopeModel),
}

impl ModelArtifact {
    /// Decode and structurally check an artifact.
    pub fn from_slice(name: &str, bytes: &[u8]) -> Result<Self, ModelError> {
        let artifact: Self = serde_json::from_slice(bytes).map_err(|e| ModelError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let checked = match &artifact {
            Self::IsolationForest(m) => m.validate(),
            Self::Envelope(m) => m.validate(),
        };
        checked.map_err(|reason| ModelError::Corrupt {
            name: name.to_string(),
            reason,
        })?;
        Ok(artifact)
    }

    pub fn summary(&self) -> ModelSummary {
        match self {
            Self::IsolationForest(m) => ModelSummary {
                kind: m.kind(),
                n_features: m.n_features,
                n_trees: Some(m.trees.len()),
                max_samples: Some(m.max_samples),
                offset: Some(m.offset),
            },
            Self::Envelope(m) => ModelSummary {
                kind: m.kind(),
                n_features: m.n_features(),
                n_trees: None,
                max_samples: None,
                offset: None,
            },
        }
    }
}

impl AnomalyModel for ModelArtifact {
    fn predict(&self, features: &[f64]) -> Prediction {
        match self {
            Self::IsolationForest(m) => m.predict(features),
            Self::Envelope(m) => m.predict(features),
        }
    }

    fn n_features(&self) -> usize {
        match self {
            Self::IsolationForest(m) => m.n_features(),
            Self::Envelope(m) => m.n_features(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::IsolationForest(m) => m.kind(),
            Self::Envelope(m) => m.kind(),
        }
    }
}

/// Artifact metadata for display.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub kind: &'static str,
    pub n_features: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_trees: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
}

// ---------------------------------------------------------------------------
// Model storage
// ---------------------------------------------------------------------------

/// Read-only blob access to trained artifacts.
pub trait ModelStore: Send + Sync {
    /// Raw bytes of the named artifact (`"temperature"`, `"vibration"`).
    fn fetch(&self, name: &str) -> Result<Vec<u8>, ModelError>;

    /// Identifier of the artifact set.
    fn version(&self) -> Result<String, ModelError>;
}

/// Artifacts laid out as `<dir>/<name>_model.json` plus a `<dir>/VERSION` file.
pub struct DirModelStore {
    dir: PathBuf,
}

impl DirModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}_model.json"))
    }
}

impl ModelStore for DirModelStore {
    fn fetch(&self, name: &str) -> Result<Vec<u8>, ModelError> {
        let path = self.artifact_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ModelError::Missing(path.display().to_string()))
            }
            Err(e) => Err(ModelError::Io(e)),
        }
    }

    fn version(&self) -> Result<String, ModelError> {
        let path = self.dir.join("VERSION");
        match fs::read_to_string(&path) {
            Ok(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Ok(_) => Ok("unversioned".to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("no VERSION file in {}, using `unversioned`", self.dir.display());
                Ok("unversioned".to_string())
            }
            Err(e) => Err(ModelError::Io(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Envelope over the five temperature-model columns, flagging > `max_temp`.
    pub(crate) fn temperature_ceiling(max_temp: f64) -> EnvelopeModel {
        let mut bounds = vec![Bound::default(); 5];
        bounds[0].upper = Some(max_temp);
        EnvelopeModel { bounds }
    }

    /// One stump on column 0: `x <= split` lands in a 255-sample leaf,
    /// everything else in a 1-sample leaf.
    pub(crate) fn stump_forest(split: f64) -> IsolationForest {
        IsolationForest {
            n_features: 5,
            scaler: StandardScaler {
                mean: vec![0.0; 5],
                scale: vec![1.0; 5],
            },
            max_samples: 256,
            offset: -0.5,
            trees: vec![IsolationTree {
                children_left: vec![1, -1, -1],
                children_right: vec![2, -1, -1],
                feature: vec![0, -2, -2],
                threshold: vec![split, -2.0, -2.0],
                n_node_samples: vec![256, 255, 1],
                features: None,
            }],
        }
    }

    #[test]
    fn average_path_length_small_cases() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        let expected = 2.0 * (255f64.ln() + EULER_GAMMA) - 2.0 * 255.0 / 256.0;
        assert!((c256 - expected).abs() < 1e-12);
    }

    #[test]
    fn isolated_points_score_below_zero() {
        let forest = stump_forest(30.0);
        let normal = forest.predict(&[22.0, 0.0, 0.0, 22.0, 0.0]);
        let outlier = forest.predict(&[35.0, 0.0, 0.0, 35.0, 0.0]);
        assert!(!normal.is_anomaly, "normal score {}", normal.score);
        assert!(outlier.is_anomaly, "outlier score {}", outlier.score);
        assert!(outlier.score < normal.score);
    }

    #[test]
    fn path_length_adds_leaf_correction() {
        let tree = &stump_forest(30.0).trees[0];
        let deep = tree.path_length(&[0.0; 5]);
        assert!((deep - (1.0 + average_path_length(255))).abs() < 1e-12);
        assert_eq!(tree.path_length(&[99.0, 0.0, 0.0, 0.0, 0.0]), 1.0);
    }

    #[test]
    fn tree_feature_subset_remaps_columns() {
        let mut forest = stump_forest(30.0);
        // Tree-local feature 0 now reads input column 3.
        forest.trees[0].features = Some(vec![3, 0, 1, 2, 4]);
        let p = forest.predict(&[99.0, 0.0, 0.0, 10.0, 0.0]);
        assert!(!p.is_anomaly);
        let p = forest.predict(&[10.0, 0.0, 0.0, 99.0, 0.0]);
        assert!(p.is_anomaly);
    }

    #[test]
    fn scaler_handles_zero_scale() {
        let s = StandardScaler {
            mean: vec![1.0, 2.0],
            scale: vec![2.0, 0.0],
        };
        assert_eq!(s.transform(&[5.0, 7.0]), vec![2.0, 5.0]);
    }

    #[test]
    fn envelope_scores_signed_margin() {
        let m = temperature_ceiling(30.0);
        let inside = m.predict(&[22.0, 3.0, 1.0, 22.0, 0.0]);
        assert_eq!(inside.score, 8.0);
        assert!(!inside.is_anomaly);
        let outside = m.predict(&[35.0, 3.0, 1.0, 22.0, 0.0]);
        assert_eq!(outside.score, -5.0);
        assert!(outside.is_anomaly);
    }

    #[test]
    fn artifact_json_is_tagged_by_kind() {
        let json = r#"{"kind":"envelope","bounds":[{"upper":30.0},{},{},{},{}]}"#;
        let artifact = ModelArtifact::from_slice("temperature", json.as_bytes()).unwrap();
        assert_eq!(artifact.kind(), "envelope");
        assert_eq!(artifact.n_features(), 5);
        assert!(artifact.predict(&[31.0, 0.0, 0.0, 0.0, 0.0]).is_anomaly);
    }

    #[test]
    fn artifact_with_unknown_kind_is_corrupt() {
        let err = ModelArtifact::from_slice("t", br#"{"kind":"svm"}"#).unwrap_err();
        assert!(matches!(err, ModelError::Corrupt { .. }));
    }

    #[test]
    fn artifact_with_cyclic_tree_is_corrupt() {
        let mut forest = stump_forest(1.0);
        forest.trees[0].children_left[0] = 0;
        let bytes = serde_json::to_vec(&ModelArtifact::IsolationForest(forest)).unwrap();
        let err = ModelArtifact::from_slice("t", &bytes).unwrap_err();
        assert!(err.to_string().contains("invalid child"), "{err}");
    }

    #[test]
    fn empty_envelope_is_corrupt() {
        let json = r#"{"kind":"envelope","bounds":[{},{}]}"#;
        assert!(ModelArtifact::from_slice("t", json.as_bytes()).is_err());
    }

    #[test]
    fn dir_store_reads_artifacts_and_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirModelStore::new(tmp.path());
        assert!(matches!(store.fetch("temperature"), Err(ModelError::Missing(_))));
        assert_eq!(store.version().unwrap(), "unversioned");

        std::fs::write(store.artifact_path("temperature"), b"{}").unwrap();
        std::fs::write(tmp.path().join("VERSION"), "v7\n").unwrap();
        assert_eq!(store.fetch("temperature").unwrap(), b"{}");
        assert_eq!(store.version().unwrap(), "v7");
    }
}
