pub mod telemetry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Grid resolution used for location identity, in degrees (~1 cm).
pub const GRID_RESOLUTION: f64 = 1e-7;

/// Severity attached to a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    Normal,
    #[default]
    Caution,
    Critical,
}

impl LocationStatus {
    /// Returns the status label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Caution => "caution",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One three-axis acceleration-change measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JerkSample {
    pub vertical: f64,
    pub lateral: f64,
    pub forward: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// All samples one device contributed at one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAggregate {
    pub device_id: String,
    pub speed: f64,
    pub heading: f64,
    #[serde(default)]
    pub samples: Vec<JerkSample>,
}

impl DeviceAggregate {
    /// A device entry is mergeable only with an id and at least one sample.
    pub fn is_mergeable(&self) -> bool {
        !self.device_id.trim().is_empty() && !self.samples.is_empty()
    }
}

/// Aggregated hazard record for one coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationAggregate {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub status: LocationStatus,
    #[serde(default)]
    pub devices: Vec<DeviceAggregate>,
}

impl LocationAggregate {
    /// Identity of this location in the aggregate dataset.
    pub fn grid_key(&self) -> GridKey {
        GridKey::new(self.latitude, self.longitude)
    }

    /// Total number of samples across all devices.
    pub fn sample_count(&self) -> usize {
        self.devices.iter().map(|d| d.samples.len()).sum()
    }
}

/// Quantized coordinate used as location identity.
///
/// Two coordinates map to the same key when they round to the same
/// multiple of [`GRID_RESOLUTION`] on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridKey {
    lat: i64,
    lng: i64,
}

impl GridKey {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            lat: quantize(latitude),
            lng: quantize(longitude),
        }
    }
}

fn quantize(value: f64) -> i64 {
    // `as` saturates on overflow and maps NaN to 0.
    (value / GRID_RESOLUTION).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_key_absorbs_float_noise() {
        let a = GridKey::new(47.6, -122.3);
        let b = GridKey::new(47.6 + 1e-12, -122.3 - 1e-12);
        assert_eq!(a, b);
    }

    #[test]
    fn test_grid_key_separates_distinct_points() {
        let a = GridKey::new(47.6, -122.3);
        let b = GridKey::new(47.6001, -122.3);
        assert_ne!(a, b);
    }

    #[test]
    fn test_grid_key_negative_zero() {
        assert_eq!(GridKey::new(-0.0, 0.0), GridKey::new(0.0, -0.0));
    }

    #[test]
    fn test_device_mergeable() {
        let mut device = DeviceAggregate {
            device_id: "D1".to_string(),
            speed: 10.0,
            heading: 90.0,
            samples: vec![JerkSample {
                vertical: 1.0,
                lateral: 2.0,
                forward: 3.0,
                timestamp: None,
            }],
        };
        assert!(device.is_mergeable());

        device.samples.clear();
        assert!(!device.is_mergeable());

        device.samples.push(JerkSample {
            vertical: 1.0,
            lateral: 2.0,
            forward: 3.0,
            timestamp: None,
        });
        device.device_id = "  ".to_string();
        assert!(!device.is_mergeable());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&LocationStatus::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let status: LocationStatus = serde_json::from_str("\"caution\"").unwrap();
        assert_eq!(status, LocationStatus::Caution);
    }

    #[test]
    fn test_location_defaults_missing_fields() {
        let loc: LocationAggregate =
            serde_json::from_str(r#"{"latitude": 1.5, "longitude": 2.5}"#).unwrap();
        assert_eq!(loc.status, LocationStatus::Caution);
        assert!(loc.devices.is_empty());
        assert!(loc.altitude.is_none());
    }
}
