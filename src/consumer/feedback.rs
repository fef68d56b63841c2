//! Proximity feedback: tell map-bound devices about hazards around them.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::command::CommandChannel;
use super::{
    Checkpointer, CloseReason, EventMessage, EventProcessor, PartitionContext, ProcessorLifecycle,
};
use crate::export::health::HealthMetrics;
use crate::model::telemetry::{decode_position, DevicePosition};
use crate::model::{LocationAggregate, LocationStatus};
use crate::store::aggregate::{AggregateSnapshot, LocationAggregateStore};
use crate::store::BlobBackend;

const CONSUMER: &str = "feedback";

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default radius within which hazards are reported.
pub const DEFAULT_PROXIMITY_METERS: f64 = 100.0;

/// Great-circle distance between two coordinates, in meters.
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lng2 - lng1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// The device's own position, echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CurrentUserLocation {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub heading: f64,
}

/// A hazard location without its device list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NearbyHazard {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub status: LocationStatus,
}

impl From<&LocationAggregate> for NearbyHazard {
    fn from(location: &LocationAggregate) -> Self {
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            altitude: location.altitude,
            status: location.status,
        }
    }
}

/// Message sent to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedbackPayload {
    pub current_user_location: CurrentUserLocation,
    pub nearest_jerks: Vec<NearbyHazard>,
}

/// Build the payload for `position` from the locations within `radius_meters`.
pub fn build_feedback(
    device_id: &str,
    position: &DevicePosition,
    locations: &[LocationAggregate],
    radius_meters: f64,
) -> FeedbackPayload {
    let nearest_jerks = locations
        .iter()
        .filter(|l| {
            haversine_meters(position.latitude, position.longitude, l.latitude, l.longitude)
                < radius_meters
        })
        .map(NearbyHazard::from)
        .collect();

    FeedbackPayload {
        current_user_location: CurrentUserLocation {
            device_id: device_id.to_string(),
            latitude: position.latitude,
            longitude: position.longitude,
            altitude: position.altitude.unwrap_or_default(),
            heading: position.heading,
        },
        nearest_jerks,
    }
}

/// Snapshot used for one batch, loaded on first need.
enum BatchSnapshot {
    Pending,
    Loaded(AggregateSnapshot),
    Unavailable,
}

/// Partition processor answering position reports with nearby hazards.
pub struct FeedbackProcessor<B, C> {
    store: Arc<LocationAggregateStore<B>>,
    channel: Arc<C>,
    proximity_meters: f64,
    lifecycle: ProcessorLifecycle,
    health: Option<Arc<HealthMetrics>>,
}

impl<B: BlobBackend, C: CommandChannel> FeedbackProcessor<B, C> {
    pub fn new(store: Arc<LocationAggregateStore<B>>, channel: Arc<C>) -> Self {
        Self {
            store,
            channel,
            proximity_meters: DEFAULT_PROXIMITY_METERS,
            lifecycle: ProcessorLifecycle::new(CONSUMER),
            health: None,
        }
    }

    pub fn with_proximity(mut self, meters: f64) -> Self {
        self.proximity_meters = meters;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn lifecycle(&self) -> &ProcessorLifecycle {
        &self.lifecycle
    }

    pub fn lifecycle_mut(&mut self) -> &mut ProcessorLifecycle {
        &mut self.lifecycle
    }

    async fn snapshot<'a>(
        &self,
        partition_id: &str,
        state: &'a mut BatchSnapshot,
    ) -> Option<&'a AggregateSnapshot> {
        if let BatchSnapshot::Pending = state {
            *state = match self.store.load_snapshot().await {
                Ok(snapshot) => BatchSnapshot::Loaded(snapshot),
                Err(e) => {
                    error!(
                        partition = partition_id,
                        error = %e,
                        "loading location aggregate failed, no feedback for this batch",
                    );
                    BatchSnapshot::Unavailable
                }
            };
        }

        match state {
            BatchSnapshot::Loaded(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    async fn send(&self, partition_id: &str, offset: &str, payload: &FeedbackPayload) {
        let device_id = payload.current_user_location.device_id.as_str();
        let data = match serde_json::to_vec(payload) {
            Ok(data) => data,
            Err(e) => {
                error!(partition = partition_id, offset, error = %e, "encoding feedback failed");
                return;
            }
        };

        match self.channel.send(device_id, data).await {
            Ok(()) => {
                if let Some(health) = &self.health {
                    health.feedback_sent.inc();
                }
                debug!(
                    partition = partition_id,
                    device = device_id,
                    hazards = payload.nearest_jerks.len(),
                    "sent feedback",
                );
            }
            Err(e) => {
                if let Some(health) = &self.health {
                    health.feedback_send_errors.inc();
                }
                warn!(
                    partition = partition_id,
                    offset,
                    device = device_id,
                    error = %e,
                    "sending feedback failed",
                );
            }
        }
    }
}

impl<B: BlobBackend, C: CommandChannel> EventProcessor for FeedbackProcessor<B, C> {
    fn name(&self) -> &'static str {
        CONSUMER
    }

    async fn open<K: Checkpointer>(&mut self, ctx: &PartitionContext<K>) -> Result<()> {
        self.lifecycle.on_open(ctx.partition_id(), self.health.as_deref());
        info!(
            consumer = CONSUMER,
            partition = ctx.partition_id(),
            group = ctx.consumer_group(),
            "partition opened",
        );
        Ok(())
    }

    async fn process_batch<K: Checkpointer>(
        &mut self,
        ctx: &mut PartitionContext<K>,
        messages: Vec<EventMessage>,
    ) -> Result<()> {
        let health = self.health.as_deref();
        if !self.lifecycle.begin_batch(messages.len(), health) {
            return Ok(());
        }
        let started = Instant::now();
        let mut snapshot = BatchSnapshot::Pending;

        for message in &messages {
            self.lifecycle.record_message(ctx, message, health);

            let position = match decode_position(&message.body) {
                Ok(position) => position,
                Err(e) => {
                    if let Some(health) = health {
                        health
                            .message_decode_errors
                            .with_label_values(&[CONSUMER])
                            .inc();
                    }
                    warn!(
                        partition = ctx.partition_id(),
                        offset = %message.offset,
                        error = %e,
                        "skipping undecodable position message",
                    );
                    continue;
                }
            };

            if !position.map_is_bound {
                continue;
            }
            let Some(device_id) = position
                .device_id
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
            else {
                debug!(
                    partition = ctx.partition_id(),
                    offset = %message.offset,
                    "position without device id, nothing to answer",
                );
                continue;
            };

            let Some(current) = self.snapshot(ctx.partition_id(), &mut snapshot).await else {
                continue;
            };
            let payload = build_feedback(
                device_id,
                &position,
                &current.locations,
                self.proximity_meters,
            );
            self.send(ctx.partition_id(), &message.offset, &payload)
                .await;
        }

        self.lifecycle.checkpoint(ctx, health).await;
        self.lifecycle.record_batch(started, health);
        Ok(())
    }

    async fn close<K: Checkpointer>(
        &mut self,
        ctx: &mut PartitionContext<K>,
        reason: CloseReason,
    ) -> Result<()> {
        info!(
            consumer = CONSUMER,
            partition = ctx.partition_id(),
            %reason,
            messages = self.lifecycle.total_messages(),
            last_offset = self.lifecycle.last_offset(),
            uptime_secs = self.lifecycle.uptime().map(|d| d.as_secs()).unwrap_or_default(),
            "partition closing",
        );
        self.lifecycle.on_close(reason, self.health.as_deref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::command::MemoryCommandChannel;
    use crate::consumer::MemoryCheckpointer;
    use crate::model::DeviceAggregate;
    use crate::model::JerkSample;
    use crate::store::MemoryBlobBackend;

    fn location(lat: f64, lng: f64, status: LocationStatus) -> LocationAggregate {
        LocationAggregate {
            latitude: lat,
            longitude: lng,
            altitude: Some(12.0),
            status,
            devices: vec![DeviceAggregate {
                device_id: "D1".to_string(),
                speed: 30.0,
                heading: 90.0,
                samples: vec![JerkSample {
                    vertical: 32.0,
                    lateral: 10.0,
                    forward: 0.0,
                    timestamp: None,
                }],
            }],
        }
    }

    fn position(device: &str, lat: f64, lng: f64, bound: bool) -> EventMessage {
        EventMessage::new(
            "0",
            format!(
                r#"{{"deviceid":"{device}","latitude":{lat},"longitude":{lng},"heading":45,"mapisbound":{bound}}}"#
            )
            .into_bytes(),
        )
    }

    #[test]
    fn test_haversine_one_degree_longitude_at_equator() {
        let d = haversine_meters(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 200.0, "got {d}");
        assert_eq!(haversine_meters(47.6, -122.3, 47.6, -122.3), 0.0);
    }

    #[test]
    fn test_build_feedback_filters_by_radius() {
        let locations = vec![
            location(47.6, -122.3, LocationStatus::Critical),
            location(47.61, -122.3, LocationStatus::Caution),
        ];
        let pos: DevicePosition = serde_json::from_str(
            r#"{"deviceid":"car","latitude":47.6001,"longitude":-122.3001,"mapisbound":true}"#,
        )
        .unwrap();

        let payload = build_feedback("car", &pos, &locations, DEFAULT_PROXIMITY_METERS);
        assert_eq!(payload.nearest_jerks.len(), 1);
        assert_eq!(payload.nearest_jerks[0].status, LocationStatus::Critical);
        assert_eq!(payload.current_user_location.device_id, "car");
        assert_eq!(payload.current_user_location.altitude, 0.0);
    }

    #[test]
    fn test_payload_wire_names() {
        let pos: DevicePosition =
            serde_json::from_str(r#"{"deviceid":"car","latitude":1,"longitude":2}"#).unwrap();
        let payload = build_feedback("car", &pos, &[], DEFAULT_PROXIMITY_METERS);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["CurrentUserLocation"]["DeviceId"], "car");
        assert!(json["NearestJerks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_sends_to_bound_devices_only() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let store = Arc::new(LocationAggregateStore::new(backend, "aggregate/locations.json"));
        store
            .merge_and_save(&[location(47.6, -122.3, LocationStatus::Critical)])
            .await
            .unwrap();

        let channel = Arc::new(MemoryCommandChannel::new());
        channel.mark_unreachable("lost");
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let mut ctx = PartitionContext::new(CONSUMER, "1", Arc::clone(&checkpointer));
        let mut processor = FeedbackProcessor::new(store, Arc::clone(&channel));

        processor.open(&ctx).await.unwrap();
        let mut messages = vec![
            position("lost", 47.6001, -122.3001, true),
            position("car", 47.6001, -122.3001, true),
            position("idle", 47.6001, -122.3001, false),
            EventMessage::new("0", b"garbage".to_vec()),
        ];
        for (i, m) in messages.iter_mut().enumerate() {
            m.offset = i.to_string();
        }
        processor.process_batch(&mut ctx, messages).await.unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "car");
        let payload: FeedbackPayload = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(payload.nearest_jerks.len(), 1);

        assert_eq!(
            checkpointer.last_checkpoint(CONSUMER, "1").await.unwrap(),
            Some("3".to_string())
        );
        assert_eq!(processor.lifecycle().total_messages(), 4);
    }
}
