//! Location Aggregate Store: the whole hazard dataset kept as one
//! versioned JSON blob, updated by read-merge-conditional-write.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::{BlobBackend, BlobError, Version, WriteCondition};
use crate::export::health::HealthMetrics;
use crate::model::{DeviceAggregate, GridKey, JerkSample, LocationAggregate, LocationStatus};

/// Padding applied around the map bounding box, in degrees.
pub const BOUNDS_PADDING: f64 = 0.05;

/// Map centre used when the dataset is empty.
pub const DEFAULT_CENTER: (f64, f64) = (47.6, -122.3);

/// Errors from the aggregate store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("aggregate blob {name} changed since it was read")]
    Conflict { name: String },

    #[error("aggregate blob {name} is not valid JSON: {source}")]
    InvalidFormat {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error(transparent)]
    Storage(BlobError),
}

impl From<BlobError> for StoreError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::Conflict { name } => Self::Conflict { name },
            other => Self::Storage(other),
        }
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// The aggregate dataset as read, with the version it was read at.
///
/// `version` is `None` when the blob does not exist yet.
#[derive(Debug, Clone, Default)]
pub struct AggregateSnapshot {
    pub locations: Vec<LocationAggregate>,
    pub version: Option<Version>,
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Whether anything was written.
    pub written: bool,
    /// Locations in the dataset after the merge.
    pub locations: usize,
    /// Write attempts made, including the successful one.
    pub attempts: u32,
}

/// Bounding box of the dataset for map display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapBounds {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

/// All locations plus the padded map bounds.
#[derive(Debug, Clone, Serialize)]
pub struct LocationOverview {
    pub locations: Vec<LocationAggregate>,
    pub bounds: MapBounds,
}

/// One location with its device count.
#[derive(Debug, Clone, Serialize)]
pub struct LocationDetails {
    #[serde(flatten)]
    pub location: LocationAggregate,
    pub device_count: usize,
}

/// One device's samples at one location, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: LocationStatus,
    pub speed: f64,
    pub heading: f64,
    pub samples: Vec<JerkSample>,
}

impl AggregateSnapshot {
    /// Location stored at this coordinate, if any.
    pub fn find(&self, latitude: f64, longitude: f64) -> Option<&LocationAggregate> {
        let key = GridKey::new(latitude, longitude);
        self.locations.iter().find(|l| l.grid_key() == key)
    }

    /// Locations plus map bounds padded by [`BOUNDS_PADDING`].
    pub fn overview(&self) -> LocationOverview {
        let bounds = if self.locations.is_empty() {
            let (lat, lng) = DEFAULT_CENTER;
            MapBounds {
                min_latitude: lat,
                max_latitude: lat,
                min_longitude: lng,
                max_longitude: lng,
            }
        } else {
            self.locations.iter().fold(
                MapBounds {
                    min_latitude: f64::MAX,
                    max_latitude: f64::MIN,
                    min_longitude: f64::MAX,
                    max_longitude: f64::MIN,
                },
                |b, l| MapBounds {
                    min_latitude: b.min_latitude.min(l.latitude),
                    max_latitude: b.max_latitude.max(l.latitude),
                    min_longitude: b.min_longitude.min(l.longitude),
                    max_longitude: b.max_longitude.max(l.longitude),
                },
            )
        };

        LocationOverview {
            locations: self.locations.clone(),
            bounds: MapBounds {
                min_latitude: bounds.min_latitude - BOUNDS_PADDING,
                max_latitude: bounds.max_latitude + BOUNDS_PADDING,
                min_longitude: bounds.min_longitude - BOUNDS_PADDING,
                max_longitude: bounds.max_longitude + BOUNDS_PADDING,
            },
        }
    }

    pub fn details(&self, latitude: f64, longitude: f64) -> Option<LocationDetails> {
        self.find(latitude, longitude).map(|l| LocationDetails {
            device_count: l.devices.len(),
            location: l.clone(),
        })
    }

    pub fn device_report(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Option<DeviceReport> {
        let location = self.find(latitude, longitude)?;
        let device = location.devices.iter().find(|d| d.device_id == device_id)?;

        let mut samples = device.samples.clone();
        samples.sort_by_key(|s| s.timestamp);

        Some(DeviceReport {
            device_id: device.device_id.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            status: location.status,
            speed: device.speed,
            heading: device.heading,
            samples,
        })
    }
}

/// Fold one delta into a location list.
///
/// Devices without an id or without samples are dropped from the delta;
/// a delta left with no devices changes nothing. A new location is
/// appended. For an existing location, each delta device either extends
/// the samples of the device with the same id or is appended. The
/// existing location's status and coordinates are kept.
///
/// Returns whether the list changed.
pub fn merge_location(locations: &mut Vec<LocationAggregate>, mut delta: LocationAggregate) -> bool {
    delta.devices.retain(DeviceAggregate::is_mergeable);
    if delta.devices.is_empty() {
        return false;
    }

    let key = delta.grid_key();
    let Some(idx) = locations.iter().position(|l| l.grid_key() == key) else {
        locations.push(delta);
        return true;
    };
    let existing = &mut locations[idx];

    for device in delta.devices {
        match existing
            .devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
        {
            Some(current) => current.samples.extend(device.samples),
            None => existing.devices.push(device),
        }
    }

    true
}

fn validate_delta(delta: &LocationAggregate) -> Result<(), StoreError> {
    if !delta.latitude.is_finite() || !delta.longitude.is_finite() {
        return Err(StoreError::InvalidArgument {
            reason: format!(
                "location coordinates must be finite, got ({}, {})",
                delta.latitude, delta.longitude
            ),
        });
    }
    Ok(())
}

/// Store for the location aggregate dataset.
pub struct LocationAggregateStore<B> {
    backend: Arc<B>,
    blob_name: String,
    health: Option<Arc<HealthMetrics>>,
}

impl<B: BlobBackend> LocationAggregateStore<B> {
    pub fn new(backend: Arc<B>, blob_name: impl Into<String>) -> Self {
        Self {
            backend,
            blob_name: blob_name.into(),
            health: None,
        }
    }

    /// Record merge conflicts and the tracked-location gauge.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Read the current dataset. A missing blob is an empty dataset.
    pub async fn load_snapshot(&self) -> Result<AggregateSnapshot, StoreError> {
        let Some(blob) = self.backend.get(&self.blob_name).await? else {
            return Ok(AggregateSnapshot::default());
        };

        let locations = if blob.data.iter().all(u8::is_ascii_whitespace) {
            Vec::new()
        } else {
            serde_json::from_slice(&blob.data).map_err(|source| StoreError::InvalidFormat {
                name: self.blob_name.clone(),
                source,
            })?
        };

        Ok(AggregateSnapshot {
            locations,
            version: Some(blob.version),
        })
    }

    async fn save(
        &self,
        locations: &[LocationAggregate],
        read_version: Option<&Version>,
    ) -> Result<Version, StoreError> {
        let data = serde_json::to_vec(locations).map_err(|source| StoreError::InvalidFormat {
            name: self.blob_name.clone(),
            source,
        })?;

        let version = self
            .backend
            .put(&self.blob_name, data, WriteCondition::from_read(read_version))
            .await?;

        if let Some(health) = &self.health {
            health.locations_tracked.set(locations.len() as f64);
        }

        Ok(version)
    }

    /// Merge `deltas` into the dataset with a single conditional write.
    ///
    /// Fails with [`StoreError::Conflict`] if another writer saved in
    /// between; nothing is written in that case.
    pub async fn merge_and_save(
        &self,
        deltas: &[LocationAggregate],
    ) -> Result<MergeOutcome, StoreError> {
        for delta in deltas {
            validate_delta(delta)?;
        }

        let mut snapshot = self.load_snapshot().await?;
        let mut changed = false;
        for delta in deltas {
            changed |= merge_location(&mut snapshot.locations, delta.clone());
        }

        if !changed {
            debug!(blob = %self.blob_name, "merge produced no changes, skipping write");
            return Ok(MergeOutcome {
                written: false,
                locations: snapshot.locations.len(),
                attempts: 1,
            });
        }

        self.save(&snapshot.locations, snapshot.version.as_ref())
            .await?;

        Ok(MergeOutcome {
            written: true,
            locations: snapshot.locations.len(),
            attempts: 1,
        })
    }

    /// [`merge_and_save`](Self::merge_and_save), reloading and reapplying
    /// the same deltas up to `max_retries` times on conflict.
    pub async fn merge_with_retry(
        &self,
        deltas: &[LocationAggregate],
        max_retries: u32,
    ) -> Result<MergeOutcome, StoreError> {
        let mut attempt = 1;
        loop {
            match self.merge_and_save(deltas).await {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(e) if e.is_conflict() => {
                    if let Some(health) = &self.health {
                        health.merge_conflicts.inc();
                    }
                    if attempt > max_retries {
                        return Err(e);
                    }
                    warn!(
                        blob = %self.blob_name,
                        attempt,
                        max_retries,
                        "aggregate changed during merge, retrying",
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the location at this coordinate. Returns whether one was removed.
    pub async fn delete_by_coordinate(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, StoreError> {
        Ok(self.delete_batch(&[(latitude, longitude)]).await? > 0)
    }

    /// Remove every location matching one of the coordinates, in one write.
    /// Returns how many were removed.
    pub async fn delete_batch(&self, coordinates: &[(f64, f64)]) -> Result<usize, StoreError> {
        let keys: Vec<GridKey> = coordinates
            .iter()
            .map(|&(lat, lng)| GridKey::new(lat, lng))
            .collect();

        let mut snapshot = self.load_snapshot().await?;
        let before = snapshot.locations.len();
        snapshot
            .locations
            .retain(|l| !keys.contains(&l.grid_key()));
        let removed = before - snapshot.locations.len();

        if removed > 0 {
            self.save(&snapshot.locations, snapshot.version.as_ref())
                .await?;
        }

        Ok(removed)
    }

    /// Clear the dataset under the same conditional write.
    pub async fn delete_all(&self) -> Result<(), StoreError> {
        let snapshot = self.load_snapshot().await?;
        self.save(&[], snapshot.version.as_ref()).await?;
        Ok(())
    }
}
