//! Telemetry ingestion: decode, dedupe, classify and merge each batch into
//! the location aggregate.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetter, DeadLetterWriter};
use super::{
    CheckpointPolicy, Checkpointer, CloseReason, EventMessage, EventProcessor, PartitionContext,
    ProcessorLifecycle,
};
use crate::classify::classify;
use crate::dedupe::{dedupe_by, same_telemetry};
use crate::export::health::HealthMetrics;
use crate::model::telemetry::{decode_telemetry, TelemetryJerk};
use crate::model::{DeviceAggregate, LocationAggregate};
use crate::store::aggregate::{merge_location, LocationAggregateStore};
use crate::store::BlobBackend;

const CONSUMER: &str = "ingestion";

/// Batch handling knobs of the ingestion consumer.
#[derive(Debug, Clone, Default)]
pub struct IngestionSettings {
    pub checkpoint_policy: CheckpointPolicy,
    /// Extra merge attempts after a version conflict.
    pub max_merge_retries: u32,
}

/// Build the single-device delta for one telemetry item.
///
/// Items without a device id or without both coordinates yield `None`.
pub fn delta_from_telemetry(item: &TelemetryJerk) -> Option<LocationAggregate> {
    let device_id = item.device_id.as_deref().map(str::trim)?;
    if device_id.is_empty() {
        return None;
    }
    let (latitude, longitude) = (item.latitude?, item.longitude?);

    let samples = item.samples();
    Some(LocationAggregate {
        latitude,
        longitude,
        altitude: item.altitude,
        status: classify(item.speed, &samples),
        devices: vec![DeviceAggregate {
            device_id: device_id.to_string(),
            speed: item.speed,
            heading: item.heading,
            samples,
        }],
    })
}

/// Turn a decoded batch into one delta per coordinate.
///
/// Duplicate items are dropped first. Deltas landing on the same
/// coordinate are pre-merged with the store's merge rules, so the first
/// delta's status wins for that coordinate.
pub fn build_deltas(items: Vec<TelemetryJerk>) -> Vec<LocationAggregate> {
    let items = dedupe_by(items, same_telemetry);

    let mut deltas = Vec::new();
    for item in &items {
        match delta_from_telemetry(item) {
            Some(delta) => {
                merge_location(&mut deltas, delta);
            }
            None => debug!(
                device = item.device_id.as_deref().unwrap_or_default(),
                "dropping telemetry item without device id or coordinates",
            ),
        }
    }
    deltas
}

/// Partition processor feeding the location aggregate.
pub struct IngestionProcessor<B> {
    store: Arc<LocationAggregateStore<B>>,
    dead_letters: Option<Arc<DeadLetterWriter<B>>>,
    settings: IngestionSettings,
    /// First offset of the batch the checkpoint is held at, if any.
    held_from: Option<String>,
    lifecycle: ProcessorLifecycle,
    health: Option<Arc<HealthMetrics>>,
}

impl<B: BlobBackend> IngestionProcessor<B> {
    pub fn new(store: Arc<LocationAggregateStore<B>>, settings: IngestionSettings) -> Self {
        Self {
            store,
            dead_letters: None,
            settings,
            held_from: None,
            lifecycle: ProcessorLifecycle::new(CONSUMER),
            health: None,
        }
    }

    /// Park batches whose merge fails instead of dropping them.
    pub fn with_dead_letters(mut self, writer: Arc<DeadLetterWriter<B>>) -> Self {
        self.dead_letters = Some(writer);
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

    /// First offset of the unmerged batch holding the checkpoint back.
    pub fn held_from(&self) -> Option<&str> {
        self.held_from.as_deref()
    }

    /// Merge the batch's deltas. Returns whether the batch is safe to
    /// checkpoint under [`CheckpointPolicy::OnSuccess`].
    async fn merge_batch(
        &self,
        partition_id: &str,
        messages: &[EventMessage],
        deltas: Vec<LocationAggregate>,
    ) -> bool {
        let first_offset = messages.first().map(|m| m.offset.as_str()).unwrap_or_default();
        let last_offset = messages.last().map(|m| m.offset.as_str()).unwrap_or_default();

        let err = match self
            .store
            .merge_with_retry(&deltas, self.settings.max_merge_retries)
            .await
        {
            Ok(outcome) => {
                debug!(
                    partition = partition_id,
                    deltas = deltas.len(),
                    locations = outcome.locations,
                    attempts = outcome.attempts,
                    written = outcome.written,
                    "merged batch",
                );
                return true;
            }
            Err(e) => e,
        };

        if let Some(health) = &self.health {
            health.merge_failures.inc();
        }
        error!(
            partition = partition_id,
            first_offset,
            last_offset,
            error = %err,
            "merge into location aggregate failed",
        );

        let Some(writer) = &self.dead_letters else {
            return false;
        };

        let letter = DeadLetter {
            partition_id: partition_id.to_string(),
            first_offset: first_offset.to_string(),
            last_offset: last_offset.to_string(),
            reason: err.to_string(),
            parked_at: Utc::now(),
            deltas,
        };
        match writer.park(&letter).await {
            Ok(name) => {
                if let Some(health) = &self.health {
                    health.dead_lettered_batches.inc();
                }
                warn!(partition = partition_id, blob = %name, "parked failed batch");
                true
            }
            Err(e) => {
                error!(
                    partition = partition_id,
                    last_offset,
                    error = %e,
                    "failed to park batch as dead letter",
                );
                false
            }
        }
    }
}

impl<B: BlobBackend> EventProcessor for IngestionProcessor<B> {
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

        let mut items = Vec::new();
        for message in &messages {
            self.lifecycle.record_message(ctx, message, health);
            match decode_telemetry(&message.body) {
                Ok(decoded) => items.extend(decoded),
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
                        "skipping undecodable telemetry message",
                    );
                }
            }
        }

        let deltas = build_deltas(items);
        let merged = deltas.is_empty()
            || self
                .merge_batch(ctx.partition_id(), &messages, deltas)
                .await;

        // Once a batch is held, later offsets stay uncommitted too, so the
        // held batch is redelivered when the partition is reopened.
        if !merged
            && self.settings.checkpoint_policy == CheckpointPolicy::OnSuccess
            && self.held_from.is_none()
        {
            self.held_from = messages.first().map(|m| m.offset.clone());
        }
        match &self.held_from {
            Some(held_from) => warn!(
                partition = ctx.partition_id(),
                held_from = %held_from,
                offset = self.lifecycle.last_offset(),
                "unmerged batch pending, holding checkpoint",
            ),
            None => self.lifecycle.checkpoint(ctx, health).await,
        }

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
        if reason == CloseReason::Shutdown
            && !self.lifecycle.is_closed()
            && self.held_from.is_none()
        {
            self.lifecycle.checkpoint(ctx, self.health.as_deref()).await;
        }
        self.lifecycle.on_close(reason, self.health.as_deref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{MemoryCheckpointer, ProcessorState};
    use crate::model::LocationStatus;
    use crate::store::{BlobBackend, MemoryBlobBackend, WriteCondition};

    const AGGREGATE: &str = "aggregate/locations.json";

    fn item(device: &str, lat: f64, lng: f64, speed: f64, vertical: f64) -> String {
        format!(
            r#"{{"deviceid":"{device}","latitude":{lat},"longitude":{lng},"carspeed":{speed},
                "jerks":[{{"verticaljerk":{vertical},"lateraljerk":10,"forwardjerk":1,
                "jerktimestamp":"2024-05-01T10:00:00Z"}}]}}"#
        )
    }

    fn batch(offset: &str, items: &[String]) -> EventMessage {
        EventMessage::new(offset, format!("[{}]", items.join(",")).into_bytes())
    }

    struct Fixture {
        backend: Arc<MemoryBlobBackend>,
        store: Arc<LocationAggregateStore<MemoryBlobBackend>>,
        checkpointer: Arc<MemoryCheckpointer>,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(MemoryBlobBackend::new());
            let store = Arc::new(LocationAggregateStore::new(Arc::clone(&backend), AGGREGATE));
            Self {
                backend,
                store,
                checkpointer: Arc::new(MemoryCheckpointer::new()),
            }
        }

        fn context(&self) -> PartitionContext<MemoryCheckpointer> {
            PartitionContext::new(CONSUMER, "0", Arc::clone(&self.checkpointer))
        }

        async fn checkpoint(&self) -> Option<String> {
            self.checkpointer.last_checkpoint(CONSUMER, "0").await.unwrap()
        }

        async fn corrupt_aggregate(&self) {
            self.backend
                .put(AGGREGATE, b"{not json".to_vec(), WriteCondition::Any)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_delta_requires_device_and_coordinates() {
        let mut parsed: Vec<TelemetryJerk> =
            serde_json::from_str(&format!("[{}]", item("D1", 47.6, -122.3, 30.0, 32.0))).unwrap();
        let delta = delta_from_telemetry(&parsed[0]).unwrap();
        assert_eq!(delta.status, LocationStatus::Critical);
        assert_eq!(delta.devices[0].device_id, "D1");

        parsed[0].latitude = None;
        assert!(delta_from_telemetry(&parsed[0]).is_none());

        parsed[0].latitude = Some(47.6);
        parsed[0].device_id = Some("  ".to_string());
        assert!(delta_from_telemetry(&parsed[0]).is_none());
    }

    #[test]
    fn test_build_deltas_dedupes_and_groups() {
        let raw = format!(
            "[{},{},{}]",
            item("D1", 47.6, -122.3, 30.0, 32.0),
            item("D1", 47.6, -122.3, 30.0, 32.0),
            item("D2", 47.6, -122.3, 10.0, 1.0),
        );
        let items: Vec<TelemetryJerk> = serde_json::from_str(&raw).unwrap();

        let deltas = build_deltas(items);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].devices.len(), 2);
        assert_eq!(deltas[0].sample_count(), 2);
        assert_eq!(deltas[0].status, LocationStatus::Critical);
    }

    #[tokio::test]
    async fn test_batch_merges_and_checkpoints() {
        let fx = Fixture::new();
        let mut ctx = fx.context();
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), IngestionSettings::default());

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(
                &mut ctx,
                vec![
                    batch("1", &[item("D1", 47.6, -122.3, 30.0, 32.0)]),
                    EventMessage::new("2", b"not json".to_vec()),
                    batch("3", &[item("D2", 47.7, -122.4, 12.0, 3.0)]),
                ],
            )
            .await
            .unwrap();

        let snapshot = fx.store.load_snapshot().await.unwrap();
        assert_eq!(snapshot.locations.len(), 2);
        assert_eq!(
            snapshot.find(47.6, -122.3).unwrap().status,
            LocationStatus::Critical
        );
        assert_eq!(fx.checkpoint().await, Some("3".to_string()));
        assert_eq!(processor.lifecycle().total_messages(), 3);
        assert_eq!(processor.lifecycle().state(), ProcessorState::Checkpointed);
    }

    #[tokio::test]
    async fn test_failed_merge_still_checkpoints_by_default() {
        let fx = Fixture::new();
        fx.corrupt_aggregate().await;
        let mut ctx = fx.context();
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), IngestionSettings::default());

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(&mut ctx, vec![batch("7", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();

        assert_eq!(fx.checkpoint().await, Some("7".to_string()));
    }

    #[tokio::test]
    async fn test_failed_merge_holds_checkpoint_on_success_policy() {
        let fx = Fixture::new();
        fx.corrupt_aggregate().await;
        let mut ctx = fx.context();
        let settings = IngestionSettings {
            checkpoint_policy: CheckpointPolicy::OnSuccess,
            max_merge_retries: 0,
        };
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), settings);

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(&mut ctx, vec![batch("7", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();

        assert_eq!(fx.checkpoint().await, None);
    }

    #[tokio::test]
    async fn test_held_batch_survives_later_success_and_shutdown() {
        let fx = Fixture::new();
        let mut ctx = fx.context();
        let settings = IngestionSettings {
            checkpoint_policy: CheckpointPolicy::OnSuccess,
            max_merge_retries: 0,
        };
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), settings);
        processor.open(&ctx).await.unwrap();

        processor
            .process_batch(&mut ctx, vec![batch("3", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();
        assert_eq!(fx.checkpoint().await, Some("3".to_string()));

        fx.corrupt_aggregate().await;
        processor
            .process_batch(&mut ctx, vec![batch("7", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();
        assert_eq!(processor.held_from(), Some("7"));

        // The aggregate recovers, but offset 7 was never merged.
        fx.backend.delete(AGGREGATE).await.unwrap();
        processor
            .process_batch(&mut ctx, vec![batch("8", &[item("D2", 3.0, 4.0, 30.0, 1.0)])])
            .await
            .unwrap();
        assert_eq!(fx.checkpoint().await, Some("3".to_string()));

        processor.close(&mut ctx, CloseReason::Shutdown).await.unwrap();
        assert_eq!(fx.checkpoint().await, Some("3".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_does_not_commit_held_batch() {
        let fx = Fixture::new();
        fx.corrupt_aggregate().await;
        let mut ctx = fx.context();
        let settings = IngestionSettings {
            checkpoint_policy: CheckpointPolicy::OnSuccess,
            max_merge_retries: 0,
        };
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), settings);

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(&mut ctx, vec![batch("7", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();
        processor.close(&mut ctx, CloseReason::Shutdown).await.unwrap();

        assert_eq!(fx.checkpoint().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_commits_under_always_policy() {
        let fx = Fixture::new();
        fx.corrupt_aggregate().await;
        let mut ctx = fx.context();
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), IngestionSettings::default());

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(&mut ctx, vec![batch("7", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();
        processor.close(&mut ctx, CloseReason::Shutdown).await.unwrap();

        assert_eq!(processor.held_from(), None);
        assert_eq!(fx.checkpoint().await, Some("7".to_string()));
    }

    #[tokio::test]
    async fn test_dead_letter_allows_checkpoint() {
        let fx = Fixture::new();
        fx.corrupt_aggregate().await;
        let writer = Arc::new(DeadLetterWriter::new(Arc::clone(&fx.backend), "deadletter"));
        let mut ctx = fx.context();
        let settings = IngestionSettings {
            checkpoint_policy: CheckpointPolicy::OnSuccess,
            max_merge_retries: 0,
        };
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), settings)
            .with_dead_letters(Arc::clone(&writer));

        processor.open(&ctx).await.unwrap();
        processor
            .process_batch(
                &mut ctx,
                vec![
                    batch("4", &[item("D1", 1.0, 2.0, 30.0, 1.0)]),
                    batch("5", &[item("D2", 1.0, 2.0, 30.0, 1.0)]),
                ],
            )
            .await
            .unwrap();

        let parked = writer.list().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].starts_with("deadletter/0/5-"), "{parked:?}");
        assert_eq!(processor.held_from(), None);
        assert_eq!(fx.checkpoint().await, Some("5".to_string()));
    }

    #[tokio::test]
    async fn test_batch_after_close_is_flagged() {
        let fx = Fixture::new();
        let mut ctx = fx.context();
        let mut processor = IngestionProcessor::new(Arc::clone(&fx.store), IngestionSettings::default());
        let closed = processor.lifecycle_mut().take_closed_signal().unwrap();

        processor.open(&ctx).await.unwrap();
        processor
            .close(&mut ctx, CloseReason::LeaseLost)
            .await
            .unwrap();
        assert_eq!(closed.await.unwrap(), CloseReason::LeaseLost);

        processor
            .process_batch(&mut ctx, vec![batch("9", &[item("D1", 1.0, 2.0, 30.0, 1.0)])])
            .await
            .unwrap();

        assert!(processor.lifecycle().received_after_close());
        assert!(fx.store.load_snapshot().await.unwrap().locations.is_empty());
        assert_eq!(fx.checkpoint().await, None);
    }
}
