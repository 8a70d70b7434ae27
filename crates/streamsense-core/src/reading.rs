//! Sensor readings and their wire format.
//!
//! Producers publish nested JSON:
//!
//! ```json
//! {
//!   "device_id": "sensor_0001",
//!   "timestamp": "2024-01-01T12:00:00",
//!   "location": { "building": "Building_A", "floor": 3, "room": "Room_305" },
//!   "device_type": "industrial_sensor",
//!   "sensor_data": { "temperature": 23.5, "vibration": 1.2 },
//!   "is_anomaly": false
//! }
//! ```
//!
//! A flat variant with `building`/`floor`/`room`/`temperature`/`vibration` at the
//! top level is accepted as well. Only the fields the scorer needs are required.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub building: String,
    pub floor: i64,
    pub room: String,
    pub device_type: String,
    /// Degrees Celsius.
    pub temperature: f64,
    /// mm/s RMS.
    pub vibration: f64,
    /// Producer-side ground-truth label, when the producer supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labeled_anomaly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_type: Option<String>,
}

impl Reading {
    /// Reading with no location metadata.
    pub fn new(
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        temperature: f64,
        vibration: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            building: String::new(),
            floor: 0,
            room: String::new(),
            device_type: String::new(),
            temperature,
            vibration,
            labeled_anomaly: None,
            anomaly_type: None,
        }
    }

    pub fn with_location(
        mut self,
        building: impl Into<String>,
        floor: i64,
        room: impl Into<String>,
    ) -> Self {
        self.building = building.into();
        self.floor = floor;
        self.room = room.into();
        self
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    /// Decode and validate a queue payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let raw: RawReading = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        raw.validate()
    }

    /// Encode in the nested producer format.
    pub fn to_payload(&self) -> Vec<u8> {
        let value = serde_json::json!({
            "device_id": self.device_id,
            "timestamp": self.timestamp.to_rfc3339(),
            "location": {
                "building": self.building,
                "floor": self.floor,
                "room": self.room,
            },
            "device_type": self.device_type,
            "sensor_data": {
                "temperature": self.temperature,
                "vibration": self.vibration,
                "anomaly_type": self.anomaly_type,
            },
            "is_anomaly": self.labeled_anomaly,
        });
        value.to_string().into_bytes()
    }
}

/// Parse an RFC 3339 timestamp, or an offset-less ISO-8601 one taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::InvalidField {
        field: "timestamp",
        reason: format!("unrecognized timestamp `{s}`"),
    })
}

// ---------------------------------------------------------------------------
// Wire decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawLocation {
    building: Option<String>,
    floor: Option<i64>,
    room: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSensorData {
    temperature: Option<f64>,
    vibration: Option<f64>,
    anomaly_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawReading {
    device_id: Option<String>,
    timestamp: Option<String>,
    location: Option<RawLocation>,
    device_type: Option<String>,
    sensor_data: Option<RawSensorData>,
    is_anomaly: Option<bool>,

    // Flat form.
    building: Option<String>,
    floor: Option<i64>,
    room: Option<String>,
    temperature: Option<f64>,
    vibration: Option<f64>,
}

impl RawReading {
    fn validate(self) -> Result<Reading, ValidationError> {
        let device_id = self
            .device_id
            .filter(|id| !id.trim().is_empty())
            .ok_or(ValidationError::MissingField("device_id"))?;
        let timestamp = self
            .timestamp
            .as_deref()
            .ok_or(ValidationError::MissingField("timestamp"))
            .and_then(parse_timestamp)?;

        let location = self.location.unwrap_or_default();
        let sensor = self.sensor_data.unwrap_or_default();

        let temperature = sensor
            .temperature
            .or(self.temperature)
            .ok_or(ValidationError::MissingField("temperature"))?;
        let vibration = sensor
            .vibration
            .or(self.vibration)
            .ok_or(ValidationError::MissingField("vibration"))?;
        check_finite("temperature", temperature)?;
        check_finite("vibration", vibration)?;

        Ok(Reading {
            device_id,
            timestamp,
            building: location.building.or(self.building).unwrap_or_default(),
            floor: location.floor.or(self.floor).unwrap_or_default(),
            room: location.room.or(self.room).unwrap_or_default(),
            device_type: self.device_type.unwrap_or_default(),
            temperature,
            vibration,
            labeled_anomaly: self.is_anomaly,
            anomaly_type: sensor.anomaly_type,
        })
    }
}

fn check_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::InvalidField {
            field,
            reason: format!("{value} is not a finite number"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    const NESTED: &str = r#"{
        "device_id": "sensor_0001",
        "timestamp": "2024-01-01T12:30:00",
        "location": {"building": "Building_A", "floor": 3, "room": "Room_305"},
        "device_type": "industrial_sensor",
        "sensor_data": {"temperature": 23.5, "vibration": 1.2},
        "is_anomaly": false
    }"#;

    #[test]
    fn decodes_nested_producer_payload() {
        let r = Reading::from_slice(NESTED.as_bytes()).unwrap();
        assert_eq!(r.device_id, "sensor_0001");
        assert_eq!(r.building, "Building_A");
        assert_eq!(r.floor, 3);
        assert_eq!(r.room, "Room_305");
        assert_eq!(r.device_type, "industrial_sensor");
        assert_eq!(r.temperature, 23.5);
        assert_eq!(r.vibration, 1.2);
        assert_eq!(r.labeled_anomaly, Some(false));
        assert_eq!(r.timestamp.hour(), 12);
        assert_eq!(r.timestamp.minute(), 30);
    }

    #[test]
    fn decodes_flat_payload() {
        let json = r#"{"device_id":"d1","timestamp":"2024-03-05T08:00:00Z",
                       "temperature":35.0,"vibration":1.5,"building":"B"}"#;
        let r = Reading::from_slice(json.as_bytes()).unwrap();
        assert_eq!(r.temperature, 35.0);
        assert_eq!(r.building, "B");
        assert_eq!(r.floor, 0);
        assert_eq!(r.timestamp.day(), 5);
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00","temperature":1.0,"vibration":1.0}"#;
        assert_eq!(
            Reading::from_slice(json.as_bytes()),
            Err(ValidationError::MissingField("device_id"))
        );
    }

    #[test]
    fn blank_device_id_is_rejected() {
        let json = r#"{"device_id":"  ","timestamp":"2024-01-01T00:00:00","temperature":1.0,"vibration":1.0}"#;
        assert_eq!(
            Reading::from_slice(json.as_bytes()),
            Err(ValidationError::MissingField("device_id"))
        );
    }

    #[test]
    fn missing_vibration_is_rejected() {
        let json = r#"{"device_id":"d1","timestamp":"2024-01-01T00:00:00","sensor_data":{"temperature":20.0}}"#;
        assert_eq!(
            Reading::from_slice(json.as_bytes()),
            Err(ValidationError::MissingField("vibration"))
        );
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let err = Reading::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, ValidationError::MalformedPayload(_)));
    }

    #[test]
    fn bad_timestamp_is_invalid_field() {
        let json = r#"{"device_id":"d1","timestamp":"yesterday","temperature":1.0,"vibration":1.0}"#;
        let err = Reading::from_slice(json.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField {
                field: "timestamp",
                ..
            }
        ));
    }

    #[test]
    fn negative_vibration_is_not_a_validation_concern() {
        let json = r#"{"device_id":"d1","timestamp":"2024-01-01T00:00:00","temperature":1.0,"vibration":-4.0}"#;
        let r = Reading::from_slice(json.as_bytes()).unwrap();
        assert_eq!(r.vibration, -4.0);
    }

    #[test]
    fn parse_timestamp_accepts_offsets() {
        let ts = parse_timestamp("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn payload_encoding_decodes_back() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 9, 15, 0).unwrap();
        let r = Reading::new("d9", ts, 21.0, 0.9)
            .with_location("HQ", 2, "R201")
            .with_device_type("industrial_sensor");
        let back = Reading::from_slice(&r.to_payload()).unwrap();
        assert_eq!(back, r);
    }
}
