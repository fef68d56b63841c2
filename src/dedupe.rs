//! Exact-equality duplicate suppression for redelivered stream items.
//!
//! Floats compare with `==`, so two items holding NaN in the same field
//! never count as duplicates.

use crate::history::AlertHistoryItem;
use crate::model::telemetry::{JerkReading, TelemetryJerk};
use crate::model::JerkSample;

/// Two samples are equal when all axes and the timestamp match.
pub fn same_sample(a: &JerkSample, b: &JerkSample) -> bool {
    a == b
}

fn same_reading(a: &JerkReading, b: &JerkReading) -> bool {
    same_sample(&JerkSample::from(a), &JerkSample::from(b))
}

/// Two telemetry items are equal when every scalar field matches and
/// their reading lists hold the same readings, ignoring order.
pub fn same_telemetry(a: &TelemetryJerk, b: &TelemetryJerk) -> bool {
    a.device_id == b.device_id
        && a.partition_id == b.partition_id
        && a.latitude == b.latitude
        && a.longitude == b.longitude
        && a.altitude == b.altitude
        && a.speed == b.speed
        && a.heading == b.heading
        && a.vertical_threshold == b.vertical_threshold
        && a.lateral_threshold == b.lateral_threshold
        && a.forward_threshold == b.forward_threshold
        && a.rule_output == b.rule_output
        && same_readings(a.readings(), b.readings())
}

/// Multiset equality: every reading in `a` claims a distinct equal
/// reading in `b`.
fn same_readings(a: &[JerkReading], b: &[JerkReading]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut claimed = vec![false; b.len()];
    a.iter().all(|ra| {
        let slot = (0..b.len()).find(|&i| !claimed[i] && same_reading(ra, &b[i]));
        match slot {
            Some(i) => {
                claimed[i] = true;
                true
            }
            None => false,
        }
    })
}

/// Two history items are equal on device, magnitudes, rule output and timestamp.
pub fn same_alert(a: &AlertHistoryItem, b: &AlertHistoryItem) -> bool {
    a.device_id == b.device_id
        && a.vertical_magnitude == b.vertical_magnitude
        && a.lateral_magnitude == b.lateral_magnitude
        && a.rule_output == b.rule_output
        && a.timestamp == b.timestamp
}

/// Drop later duplicates under `eq`, keeping first occurrences in order.
///
/// Quadratic in the number of items; batches are bounded by the
/// consumer's `max_batch_size`.
pub fn dedupe_by<T, F>(items: Vec<T>, eq: F) -> Vec<T>
where
    F: Fn(&T, &T) -> bool,
{
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !kept.iter().any(|k| eq(k, &item)) {
            kept.push(item);
        }
    }
    kept
}
