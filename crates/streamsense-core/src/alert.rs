//! Operator alerts for detected anomalies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scorer::AnomalyResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub alert_type: String,
    #[serde(default)]
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub vibration: Option<f64>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Alert for a scored reading, or `None` when nothing was flagged.
    ///
    /// Both dimensions flagged is critical; one is a warning.
    pub fn from_result(result: &AnomalyResult, temperature: f64, vibration: f64) -> Option<Self> {
        let alert_type = match (result.is_temp_anomaly, result.is_vibration_anomaly) {
            (true, true) => "temperature_vibration",
            (true, false) => "temperature",
            (false, true) => "vibration",
            (false, false) => return None,
        };
        let severity = if result.is_temp_anomaly && result.is_vibration_anomaly {
            Severity::Critical
        } else {
            Severity::Warning
        };
        Some(Self {
            device_id: result.device_id.clone(),
            alert_type: alert_type.to_string(),
            severity,
            message: format!(
                "{alert_type} anomaly on {} (temperature {temperature:.2}, vibration {vibration:.2})",
                result.device_id
            ),
            temperature: Some(temperature),
            vibration: Some(vibration),
            raised_at: Utc::now(),
        })
    }

    /// Emit through the log facade.
    pub fn log(&self) {
        match self.severity {
            Severity::Info => log::info!("alert: {}", self.message),
            Severity::Warning | Severity::Critical => {
                log::warn!("alert [{:?}]: {}", self.severity, self.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(temp: bool, vib: bool) -> AnomalyResult {
        AnomalyResult {
            device_id: "d1".into(),
            timestamp: Utc::now(),
            model_version: "v".into(),
            temp_anomaly_score: -0.1,
            vibration_anomaly_score: 0.2,
            is_temp_anomaly: temp,
            is_vibration_anomaly: vib,
            overall_anomaly: temp || vib,
        }
    }

    #[test]
    fn no_alert_without_flags() {
        assert!(Alert::from_result(&result(false, false), 20.0, 1.0).is_none());
    }

    #[test]
    fn severity_follows_flag_count() {
        let one = Alert::from_result(&result(true, false), 35.0, 1.5).unwrap();
        assert_eq!(one.alert_type, "temperature");
        assert_eq!(one.severity, Severity::Warning);
        assert!(one.message.contains("35.00"));

        let both = Alert::from_result(&result(true, true), 35.0, 9.0).unwrap();
        assert_eq!(both.severity, Severity::Critical);
    }
}
