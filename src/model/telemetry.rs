//! Wire formats of the two inbound event streams.
//!
//! Field names follow the device firmware's lowercase JSON keys. Unknown
//! fields are ignored so newer firmware does not break decoding.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::JerkSample;

/// Errors decoding an event body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty {kind} payload")]
    Empty { kind: &'static str },

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One jerk reading as sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JerkReading {
    #[serde(rename = "verticaljerk", default)]
    pub vertical: f64,
    #[serde(rename = "lateraljerk", default)]
    pub lateral: f64,
    #[serde(rename = "forwardjerk", default)]
    pub forward: f64,
    #[serde(rename = "jerktimestamp", default, with = "flexible_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&JerkReading> for JerkSample {
    fn from(r: &JerkReading) -> Self {
        Self {
            vertical: r.vertical,
            lateral: r.lateral,
            forward: r.forward,
            timestamp: r.timestamp,
        }
    }
}

/// A telemetry item: one device's jerk readings at one coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryJerk {
    #[serde(rename = "deviceid", default)]
    pub device_id: Option<String>,
    #[serde(rename = "partitionid", default)]
    pub partition_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(rename = "carspeed", default)]
    pub speed: f64,
    #[serde(rename = "headingtowards", default)]
    pub heading: f64,
    #[serde(rename = "verticalthreshold", default)]
    pub vertical_threshold: f64,
    #[serde(rename = "lateralthreshold", default)]
    pub lateral_threshold: f64,
    #[serde(rename = "forwardthreshold", default)]
    pub forward_threshold: f64,
    #[serde(rename = "ruleoutput", default)]
    pub rule_output: Option<String>,
    #[serde(default)]
    pub jerks: Option<Vec<JerkReading>>,
}

impl TelemetryJerk {
    /// Readings carried by this item; empty when the field was absent.
    pub fn readings(&self) -> &[JerkReading] {
        self.jerks.as_deref().unwrap_or(&[])
    }

    /// Readings converted to stored samples.
    pub fn samples(&self) -> Vec<JerkSample> {
        self.readings().iter().map(JerkSample::from).collect()
    }
}

/// A device position report from the position stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePosition {
    #[serde(rename = "deviceid", default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(rename = "mapisbound", default)]
    pub map_is_bound: bool,
}

/// Decode a telemetry message body: a JSON array of telemetry items.
pub fn decode_telemetry(body: &[u8]) -> Result<Vec<TelemetryJerk>, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty { kind: "telemetry" });
    }

    serde_json::from_slice(body).map_err(|source| DecodeError::Malformed {
        kind: "telemetry",
        source,
    })
}

/// Decode a position message body: a single JSON object.
pub fn decode_position(body: &[u8]) -> Result<DevicePosition, DecodeError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty { kind: "position" });
    }

    serde_json::from_slice(body).map_err(|source| DecodeError::Malformed {
        kind: "position",
        source,
    })
}

/// Parse a timestamp as RFC 3339, or as a zone-less date-time taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
    ];

    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

mod flexible_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => super::parse_timestamp(&s)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {s}"))),
        }
    }
}
