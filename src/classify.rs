//! Severity classification of jerk samples by speed band.

use crate::model::{JerkSample, LocationStatus};

/// Lower bound of the urban speed band.
pub const URBAN_MIN_SPEED: f64 = 8.0;

/// Lower bound of the highway speed band.
pub const HIGHWAY_MIN_SPEED: f64 = 25.0;

/// Peak-magnitude thresholds of one speed band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandThresholds {
    pub vertical: f64,
    pub lateral: f64,
}

pub const URBAN_THRESHOLDS: BandThresholds = BandThresholds {
    vertical: 25.0,
    lateral: 30.0,
};

pub const HIGHWAY_THRESHOLDS: BandThresholds = BandThresholds {
    vertical: 30.0,
    lateral: 34.0,
};

/// Maximum absolute vertical and lateral values over the samples.
///
/// Returns `(0.0, 0.0)` for an empty slice.
pub fn peak_magnitudes(samples: &[JerkSample]) -> (f64, f64) {
    samples.iter().fold((0.0_f64, 0.0_f64), |(v, l), s| {
        (v.max(s.vertical.abs()), l.max(s.lateral.abs()))
    })
}

/// Thresholds applying at `speed`, or `None` below the urban band.
pub fn band_for_speed(speed: f64) -> Option<BandThresholds> {
    if (URBAN_MIN_SPEED..HIGHWAY_MIN_SPEED).contains(&speed) {
        Some(URBAN_THRESHOLDS)
    } else if speed >= HIGHWAY_MIN_SPEED {
        Some(HIGHWAY_THRESHOLDS)
    } else {
        None
    }
}

/// Classify samples captured at `speed`.
///
/// Anything that does not cross a band threshold is `Caution`; a NaN
/// speed falls in no band.
pub fn classify(speed: f64, samples: &[JerkSample]) -> LocationStatus {
    let Some(band) = band_for_speed(speed) else {
        return LocationStatus::Caution;
    };

    let (vertical, lateral) = peak_magnitudes(samples);
    if vertical >= band.vertical || lateral >= band.lateral {
        LocationStatus::Critical
    } else {
        LocationStatus::Caution
    }
}
