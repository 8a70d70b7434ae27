//! Append-only result storage.
//!
//! Rows are partitioned by `(device_id, date(timestamp))`, mirroring a
//! day-partitioned, device-clustered warehouse table. Redelivered messages may
//! append the same row twice; duplicates are accepted.
//!
//! # Storage Format
//!
//! [`PartitionedFileSink`] writes JSON lines to
//! `<root>/date=YYYY-MM-DD/device_id=<id>/records.jsonl`, with the device id
//! percent-encoded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::SinkError;
use crate::reading::Reading;
use crate::scorer::AnomalyResult;
use crate::window::FeatureVector;

/// Warehouse row: the anomaly result plus the reading and features behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub building: String,
    pub floor: i64,
    pub room: String,
    pub device_type: String,
    pub temperature: f64,
    pub vibration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeled_anomaly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_type: Option<String>,
    pub temp_moving_avg: f64,
    pub vibration_moving_avg: f64,
    pub temp_zscore: f64,
    pub vibration_zscore: f64,
    pub model_version: String,
    pub temp_anomaly_score: f64,
    pub vibration_anomaly_score: f64,
    pub is_temp_anomaly: bool,
    pub is_vibration_anomaly: bool,
    pub overall_anomaly: bool,
}

impl ScoredRecord {
    pub fn new(reading: &Reading, features: &FeatureVector, result: &AnomalyResult) -> Self {
        Self {
            device_id: result.device_id.clone(),
            timestamp: result.timestamp,
            processed_at: Utc::now(),
            building: reading.building.clone(),
            floor: reading.floor,
            room: reading.room.clone(),
            device_type: reading.device_type.clone(),
            temperature: reading.temperature,
            vibration: reading.vibration,
            labeled_anomaly: reading.labeled_anomaly,
            anomaly_type: reading.anomaly_type.clone(),
            temp_moving_avg: features.temp_moving_avg,
            vibration_moving_avg: features.vibration_moving_avg,
            temp_zscore: features.temp_zscore,
            vibration_zscore: features.vibration_zscore,
            model_version: result.model_version.clone(),
            temp_anomaly_score: result.temp_anomaly_score,
            vibration_anomaly_score: result.vibration_anomaly_score,
            is_temp_anomaly: result.is_temp_anomaly,
            is_vibration_anomaly: result.is_vibration_anomaly,
            overall_anomaly: result.overall_anomaly,
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(&self.device_id, self.timestamp)
    }

    /// The [`AnomalyResult`] portion of the row.
    pub fn result(&self) -> AnomalyResult {
        AnomalyResult {
            device_id: self.device_id.clone(),
            timestamp: self.timestamp,
            model_version: self.model_version.clone(),
            temp_anomaly_score: self.temp_anomaly_score,
            vibration_anomaly_score: self.vibration_anomaly_score,
            is_temp_anomaly: self.is_temp_anomaly,
            is_vibration_anomaly: self.is_vibration_anomaly,
            overall_anomaly: self.overall_anomaly,
        }
    }
}

/// `(device_id, UTC date)` partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub device_id: String,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            date: timestamp.date_naive(),
        }
    }

    /// Relative directory for this partition.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("date={}", self.date.format("%Y-%m-%d")))
            .join(format!("device_id={}", encode_path_segment(&self.device_id)))
    }
}

/// Percent-encode a device id into a path segment. Distinct ids always map to
/// distinct segments.
fn encode_path_segment(s: &str) -> String {
    let encoded = urlencoding::encode(s);
    // `.` and `..` would escape the partition directory.
    if !encoded.is_empty() && encoded.chars().all(|c| c == '.') {
        encoded.replace('.', "%2E")
    } else {
        encoded.into_owned()
    }
}

/// Durable, append-only destination for scored records.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Returns only after the record is durably written.
    async fn append(&self, record: &ScoredRecord) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// File sink
// ---------------------------------------------------------------------------

const RECORDS_FILE: &str = "records.jsonl";

/// JSON-lines files, one per partition.
pub struct PartitionedFileSink {
    root: PathBuf,
    locks: Mutex<HashMap<PartitionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionedFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_file(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.relative_dir()).join(RECORDS_FILE)
    }

    /// Read back every record in a partition, in append order.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<ScoredRecord>, SinkError> {
        let path = self.partition_file(key);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SinkError::Io { path, source }),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(SinkError::from))
            .collect()
    }

    fn partition_lock(&self, key: &PartitionKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

#[async_trait]
impl ResultSink for PartitionedFileSink {
    async fn append(&self, record: &ScoredRecord) -> Result<(), SinkError> {
        let key = record.partition_key();
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let lock = self.partition_lock(&key);
        let _guard = lock.lock().await;

        let dir = self.root.join(key.relative_dir());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| SinkError::Io {
                path: dir.clone(),
                source,
            })?;
        let path = dir.join(RECORDS_FILE);
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory sink
// ---------------------------------------------------------------------------

/// In-process partitioned store.
#[derive(Default)]
pub struct MemorySink {
    partitions: Mutex<HashMap<PartitionKey, Vec<ScoredRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, key: &PartitionKey) -> Vec<ScoredRecord> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    /// Every record for a device across days, in append order per day.
    pub fn records_for(&self, device_id: &str) -> Vec<ScoredRecord> {
        let partitions = self.lock();
        let mut keys: Vec<_> = partitions
            .keys()
            .filter(|k| k.device_id == device_id)
            .collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|k| partitions[k].iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PartitionKey, Vec<ScoredRecord>>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn append(&self, record: &ScoredRecord) -> Result<(), SinkError> {
        self.lock()
            .entry(record.partition_key())
            .or_default()
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn record(device: &str, day: u32, hour: u32, temperature: f64) -> ScoredRecord {
        let ts = Utc.with_ymd_and_hms(2024, 2, day, hour, 0, 0).unwrap();
        let reading = Reading::new(device, ts, temperature, 1.0).with_location("A", 1, "R1");
        let features = crate::window::FeatureWindows::default().observe(device, &reading);
        let result = AnomalyResult {
            device_id: device.to_string(),
            timestamp: ts,
            model_version: "v1".into(),
            temp_anomaly_score: 0.1,
            vibration_anomaly_score: 0.2,
            is_temp_anomaly: false,
            is_vibration_anomaly: false,
            overall_anomaly: false,
        };
        ScoredRecord::new(&reading, &features, &result)
    }

    #[test]
    fn partition_dir_layout() {
        let key = PartitionKey::new("sensor_01", Utc.with_ymd_and_hms(2024, 2, 9, 23, 59, 0).unwrap());
        assert_eq!(
            key.relative_dir(),
            PathBuf::from("date=2024-02-09").join("device_id=sensor_01")
        );
    }

    #[test]
    fn device_ids_are_encoded_for_paths() {
        assert_eq!(encode_path_segment("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_path_segment(".."), "%2E%2E");
        assert_eq!(encode_path_segment("dev-1.x"), "dev-1.x");
        assert_ne!(encode_path_segment("a/b"), encode_path_segment("a_b"));
        assert_ne!(encode_path_segment("a%2Fb"), encode_path_segment("a/b"));
    }

    #[test]
    fn record_carries_reading_and_result_fields() {
        let r = record("d1", 3, 4, 26.0);
        assert_eq!(r.building, "A");
        assert_eq!(r.temperature, 26.0);
        assert_eq!(r.result().device_id, "d1");
        assert_eq!(r.result().model_version, "v1");
    }

    #[tokio::test]
    async fn file_sink_appends_in_order_per_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = PartitionedFileSink::new(tmp.path());
        for (hour, t) in [(1, 20.0), (2, 21.0), (3, 22.0)] {
            sink.append(&record("d1", 5, hour, t)).await.unwrap();
        }
        sink.append(&record("d1", 6, 0, 30.0)).await.unwrap();
        sink.append(&record("d2", 5, 0, 40.0)).await.unwrap();

        let key = record("d1", 5, 0, 0.0).partition_key();
        let rows = sink.read_partition(&key).unwrap();
        let temps: Vec<f64> = rows.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![20.0, 21.0, 22.0]);

        assert!(tmp.path().join("date=2024-02-06/device_id=d1/records.jsonl").exists());
        assert!(tmp.path().join("date=2024-02-05/device_id=d2/records.jsonl").exists());
    }

    #[tokio::test]
    async fn file_sink_accepts_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = PartitionedFileSink::new(tmp.path());
        let r = record("d1", 5, 1, 20.0);
        sink.append(&r).await.unwrap();
        sink.append(&r).await.unwrap();
        assert_eq!(sink.read_partition(&r.partition_key()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_sink_concurrent_appends_lose_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = Arc::new(PartitionedFileSink::new(tmp.path()));
        let mut handles = Vec::new();
        for d in 0..4 {
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let r = record(&format!("dev{d}"), 7, 0, i as f64);
                    sink.append(&r).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for d in 0..4 {
            let key = record(&format!("dev{d}"), 7, 0, 0.0).partition_key();
            let temps: Vec<f64> = sink
                .read_partition(&key)
                .unwrap()
                .iter()
                .map(|r| r.temperature)
                .collect();
            assert_eq!(temps, (0..25).map(|i| i as f64).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn lookalike_device_ids_get_separate_partitions() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = PartitionedFileSink::new(tmp.path());
        sink.append(&record("a/b", 5, 0, 20.0)).await.unwrap();
        sink.append(&record("a_b", 5, 0, 30.0)).await.unwrap();

        let slash = sink.read_partition(&record("a/b", 5, 0, 0.0).partition_key()).unwrap();
        let underscore = sink.read_partition(&record("a_b", 5, 0, 0.0).partition_key()).unwrap();
        assert_eq!(slash.len(), 1);
        assert_eq!(slash[0].device_id, "a/b");
        assert_eq!(underscore.len(), 1);
        assert_eq!(underscore[0].device_id, "a_b");
        assert!(tmp.path().join("date=2024-02-05/device_id=a%2Fb/records.jsonl").exists());
    }

    #[tokio::test]
    async fn missing_partition_reads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = PartitionedFileSink::new(tmp.path());
        assert!(sink
            .read_partition(&record("nobody", 1, 0, 0.0).partition_key())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn memory_sink_groups_by_partition() {
        let sink = MemorySink::new();
        sink.append(&record("d1", 5, 1, 20.0)).await.unwrap();
        sink.append(&record("d1", 6, 1, 21.0)).await.unwrap();
        sink.append(&record("d2", 5, 1, 22.0)).await.unwrap();
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.partition(&record("d1", 5, 0, 0.0).partition_key()).len(), 1);
        let temps: Vec<f64> = sink.records_for("d1").iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![20.0, 21.0]);
    }
}
