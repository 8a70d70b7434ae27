//! Per-device rolling windows and feature extraction.
//!
//! Each device keeps the last `capacity` temperature and vibration samples.
//! [`FeatureWindows::observe`] derives the feature vector for a reading from the
//! window as it stood *before* that reading, then folds the reading in, so a
//! point is never normalized against itself.
//!
//! Windows are spread over a fixed set of mutex-guarded shards keyed by a hash
//! of the device id. Unrelated devices rarely share a lock; one device always
//! maps to the same shard, which serializes its updates.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::Reading;

/// Default number of readings kept per device.
pub const DEFAULT_WINDOW_CAPACITY: usize = 10;
/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 16;

/// Standard deviations below this are treated as zero variance.
const MIN_STDDEV: f64 = 1e-9;

/// Model-ready features for one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub vibration: f64,
    pub temp_moving_avg: f64,
    pub vibration_moving_avg: f64,
    pub temp_zscore: f64,
    pub vibration_zscore: f64,
    /// 0..=23, UTC.
    pub hour_of_day: u32,
    /// 0..=6, Monday = 0.
    pub day_of_week: u32,
}

impl FeatureVector {
    /// Inputs for the temperature model, in fitted column order.
    pub fn temperature_inputs(&self) -> [f64; 5] {
        [
            self.temperature,
            f64::from(self.hour_of_day),
            f64::from(self.day_of_week),
            self.temp_moving_avg,
            self.temp_zscore,
        ]
    }

    /// Inputs for the vibration model, in fitted column order.
    pub fn vibration_inputs(&self) -> [f64; 5] {
        [
            self.vibration,
            f64::from(self.hour_of_day),
            f64::from(self.day_of_week),
            self.vibration_moving_avg,
            self.vibration_zscore,
        ]
    }
}

/// Population mean and standard deviation of one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    pub stddev: f64,
}

impl WindowStats {
    pub fn of(values: &VecDeque<f64>) -> Self {
        let count = values.len();
        if count == 0 {
            return Self {
                count,
                mean: 0.0,
                stddev: 0.0,
            };
        }
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            count,
            mean,
            stddev: variance.sqrt(),
        }
    }

    /// Z-score of `value`; zero when the window is too small or flat.
    pub fn zscore(&self, value: f64) -> f64 {
        if self.count < 2 || self.stddev < MIN_STDDEV {
            0.0
        } else {
            (value - self.mean) / self.stddev
        }
    }

    /// Moving average, falling back to `value` for an empty window.
    pub fn moving_avg_or(&self, value: f64) -> f64 {
        if self.count == 0 { value } else { self.mean }
    }
}

/// Bounded FIFO history for a single device.
#[derive(Debug, Clone)]
pub struct DeviceWindow {
    capacity: usize,
    temperatures: VecDeque<f64>,
    vibrations: VecDeque<f64>,
}

impl DeviceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            temperatures: VecDeque::with_capacity(capacity),
            vibrations: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    /// Features for `reading` against the current contents.
    pub fn extract(&self, reading: &Reading) -> FeatureVector {
        let temp = WindowStats::of(&self.temperatures);
        let vib = WindowStats::of(&self.vibrations);
        FeatureVector {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            temperature: reading.temperature,
            vibration: reading.vibration,
            temp_moving_avg: temp.moving_avg_or(reading.temperature),
            vibration_moving_avg: vib.moving_avg_or(reading.vibration),
            temp_zscore: temp.zscore(reading.temperature),
            vibration_zscore: vib.zscore(reading.vibration),
            hour_of_day: reading.timestamp.hour(),
            day_of_week: reading.timestamp.weekday().num_days_from_monday(),
        }
    }

    /// Append a reading, evicting the oldest entry at capacity.
    pub fn push(&mut self, reading: &Reading) {
        if self.temperatures.len() == self.capacity {
            self.temperatures.pop_front();
            self.vibrations.pop_front();
        }
        self.temperatures.push_back(reading.temperature);
        self.vibrations.push_back(reading.vibration);
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            temperatures: self.temperatures.iter().copied().collect(),
            vibrations: self.vibrations.iter().copied().collect(),
        }
    }
}

/// Copy of a device window, oldest sample first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub temperatures: Vec<f64>,
    pub vibrations: Vec<f64>,
}

/// Stable shard index for a device id.
pub fn device_shard(device_id: &str, shards: usize) -> usize {
    let mut h = DefaultHasher::new();
    device_id.hash(&mut h);
    (h.finish() % shards.max(1) as u64) as usize
}

/// Sharded store of per-device windows.
pub struct FeatureWindows {
    capacity: usize,
    shards: Vec<Mutex<HashMap<String, DeviceWindow>>>,
}

impl FeatureWindows {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            capacity: capacity.max(1),
            shards,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Extract features for `reading`, then fold it into the device's window.
    pub fn observe(&self, device_id: &str, reading: &Reading) -> FeatureVector {
        let mut shard = self.shard(device_id);
        let window = shard
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceWindow::new(self.capacity));
        let features = window.extract(reading);
        window.push(reading);
        features
    }

    /// Features for `reading` without folding it into the window.
    pub fn peek(&self, device_id: &str, reading: &Reading) -> FeatureVector {
        match self.shard(device_id).get(device_id) {
            Some(window) => window.extract(reading),
            None => DeviceWindow::new(self.capacity).extract(reading),
        }
    }

    /// Fold `reading` into the device's window. Pairs with [`peek`](Self::peek)
    /// when the caller must only keep readings whose processing succeeded.
    pub fn commit(&self, device_id: &str, reading: &Reading) {
        self.shard(device_id)
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceWindow::new(self.capacity))
            .push(reading);
    }

    /// Current window contents for a device, if it has been seen.
    pub fn snapshot(&self, device_id: &str) -> Option<WindowSnapshot> {
        self.shard(device_id).get(device_id).map(DeviceWindow::snapshot)
    }

    /// Number of devices with a window.
    pub fn device_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn shard(&self, device_id: &str) -> std::sync::MutexGuard<'_, HashMap<String, DeviceWindow>> {
        let idx = device_shard(device_id, self.shards.len());
        // Window updates are single pushes; a poisoned shard is still consistent.
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FeatureWindows {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY, DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn reading(device: &str, i: i64, temperature: f64, vibration: f64) -> Reading {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Reading::new(device, t0 + Duration::seconds(i), temperature, vibration)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn first_reading_has_zero_zscores() {
        let windows = FeatureWindows::default();
        let f = windows.observe("d1", &reading("d1", 0, 25.0, 1.0));
        assert_eq!(f.temp_zscore, 0.0);
        assert_eq!(f.vibration_zscore, 0.0);
        assert_eq!(f.temp_moving_avg, 25.0);
        assert_eq!(f.vibration_moving_avg, 1.0);
    }

    #[test]
    fn peek_leaves_window_untouched() {
        let windows = FeatureWindows::default();
        windows.observe("d1", &reading("d1", 0, 20.0, 1.0));
        let f = windows.peek("d1", &reading("d1", 1, 30.0, 2.0));
        assert_eq!(f.temp_moving_avg, 20.0);
        assert_eq!(windows.snapshot("d1").unwrap().temperatures, vec![20.0]);
        assert!(windows.snapshot("d9").is_none());
        let unseen = windows.peek("d9", &reading("d9", 0, 30.0, 2.0));
        assert_eq!(unseen.temp_moving_avg, 30.0);
        assert!(windows.snapshot("d9").is_none());
    }

    #[test]
    fn peek_then_commit_matches_observe() {
        let observed = FeatureWindows::default();
        let split = FeatureWindows::default();
        for i in 0..12 {
            let r = reading("d1", i, 20.0 + i as f64, 1.0);
            let a = observed.observe("d1", &r);
            let b = split.peek("d1", &r);
            split.commit("d1", &r);
            assert_eq!(a, b);
        }
        assert_eq!(observed.snapshot("d1"), split.snapshot("d1"));
    }

    #[test]
    fn single_sample_window_has_zero_zscore() {
        let windows = FeatureWindows::default();
        windows.observe("d1", &reading("d1", 0, 20.0, 1.0));
        let f = windows.observe("d1", &reading("d1", 1, 40.0, 9.0));
        assert_eq!(f.temp_zscore, 0.0);
        assert_eq!(f.temp_moving_avg, 20.0);
    }

    #[test]
    fn flat_window_has_zero_zscore_not_nan() {
        let windows = FeatureWindows::default();
        for i in 0..5 {
            windows.observe("d1", &reading("d1", i, 21.0, 1.0));
        }
        let f = windows.observe("d1", &reading("d1", 5, 50.0, 3.0));
        assert_eq!(f.temp_zscore, 0.0);
        assert_eq!(f.vibration_zscore, 0.0);
        assert!(!f.temp_zscore.is_nan());
    }

    #[test]
    fn current_reading_excluded_from_its_own_normalization() {
        let windows = FeatureWindows::default();
        windows.observe("d1", &reading("d1", 0, 20.0, 1.0));
        windows.observe("d1", &reading("d1", 1, 22.0, 1.0));
        // Prior window {20, 22}: mean 21, population stddev 1.
        let f = windows.observe("d1", &reading("d1", 2, 30.0, 1.0));
        assert!(approx(f.temp_moving_avg, 21.0));
        assert!(approx(f.temp_zscore, 9.0));
    }

    #[test]
    fn moving_average_covers_last_n_readings() {
        let windows = FeatureWindows::new(3, 4);
        for (i, t) in [10.0, 20.0, 30.0, 40.0].into_iter().enumerate() {
            windows.observe("d1", &reading("d1", i as i64, t, 0.0));
        }
        // Window holds {20, 30, 40}.
        let f = windows.observe("d1", &reading("d1", 4, 0.0, 0.0));
        assert!(approx(f.temp_moving_avg, 30.0));
    }

    #[test]
    fn twelve_readings_keep_last_ten() {
        let windows = FeatureWindows::new(10, DEFAULT_SHARDS);
        for i in 1..=12 {
            windows.observe("d2", &reading("d2", i, i as f64, i as f64 / 10.0));
        }
        let snap = windows.snapshot("d2").unwrap();
        assert_eq!(snap.temperatures.len(), 10);
        assert_eq!(snap.temperatures.first(), Some(&3.0));
        assert_eq!(snap.temperatures.last(), Some(&12.0));
        assert!(!snap.temperatures.contains(&1.0));
        assert!(!snap.temperatures.contains(&2.0));
    }

    #[test]
    fn devices_do_not_share_windows() {
        let windows = FeatureWindows::default();
        windows.observe("a", &reading("a", 0, 10.0, 1.0));
        windows.observe("a", &reading("a", 1, 12.0, 1.0));
        let f = windows.observe("b", &reading("b", 0, 99.0, 7.0));
        assert_eq!(f.temp_moving_avg, 99.0);
        assert_eq!(windows.device_count(), 2);
        assert!(windows.snapshot("c").is_none());
    }

    #[test]
    fn time_features_use_utc_calendar() {
        // 2024-01-03 is a Wednesday.
        let ts = Utc.with_ymd_and_hms(2024, 1, 3, 17, 5, 0).unwrap();
        let windows = FeatureWindows::default();
        let f = windows.observe("d1", &Reading::new("d1", ts, 20.0, 1.0));
        assert_eq!(f.hour_of_day, 17);
        assert_eq!(f.day_of_week, 2);
    }

    #[test]
    fn concurrent_observers_on_distinct_devices() {
        let windows = Arc::new(FeatureWindows::new(5, 8));
        let handles: Vec<_> = (0..8)
            .map(|d| {
                let windows = Arc::clone(&windows);
                std::thread::spawn(move || {
                    let id = format!("dev{d}");
                    for i in 0..100 {
                        windows.observe(&id, &reading(&id, i, i as f64, 0.0));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(windows.device_count(), 8);
        for d in 0..8 {
            let snap = windows.snapshot(&format!("dev{d}")).unwrap();
            assert_eq!(snap.temperatures, vec![95.0, 96.0, 97.0, 98.0, 99.0]);
        }
    }

    #[test]
    fn device_shard_is_stable_and_in_range() {
        for n in [1, 3, 16] {
            let a = device_shard("sensor_0042", n);
            assert_eq!(a, device_shard("sensor_0042", n));
            assert!(a < n);
        }
        assert_eq!(device_shard("x", 0), 0);
    }
}
