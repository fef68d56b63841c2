//! Partitioned stream consumption: the processor contract, lifecycle
//! bookkeeping and offset checkpointing shared by both consumers.

pub mod command;
pub mod dead_letter;
pub mod feedback;
pub mod ingestion;
pub mod pump;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::store::{BlobBackend, WriteCondition};

/// Offset reported before any message has been processed.
pub const NO_OFFSET: &str = "-1";

/// One event delivered from a partition.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Stream position of this message within its partition.
    pub offset: String,
    pub enqueued_at: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl EventMessage {
    pub fn new(offset: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: offset.into(),
            enqueued_at: Utc::now(),
            body: body.into(),
        }
    }
}

/// Why a processor lost its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host is shutting down.
    Shutdown,
    /// Another consumer took over the partition.
    LeaseLost,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("shutdown"),
            Self::LeaseLost => f.write_str("lease_lost"),
        }
    }
}

/// When a processed batch advances the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// Advance after every batch, even if its merge failed.
    #[default]
    Always,
    /// Advance only through batches that were merged or parked as a dead
    /// letter. After an unmerged batch the checkpoint stays put, shutdown
    /// included, until the partition is reopened.
    OnSuccess,
}

/// Lifecycle state of a partition processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Opened,
    Processing,
    Checkpointed,
    Closed(CloseReason),
}

/// Persists the last processed offset of each partition.
pub trait Checkpointer: Send + Sync {
    /// Record `offset` as processed for the partition.
    fn checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &str,
        offset: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Last recorded offset for the partition.
    fn last_checkpoint(
        &self,
        consumer_group: &str,
        partition_id: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// In-process checkpoint store.
#[derive(Default)]
pub struct MemoryCheckpointer {
    offsets: parking_lot::Mutex<HashMap<(String, String), String>>,
    failing: AtomicBool,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent checkpoint fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

impl Checkpointer for MemoryCheckpointer {
    async fn checkpoint(&self, consumer_group: &str, partition_id: &str, offset: &str) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            bail!("checkpoint store unavailable");
        }
        self.offsets.lock().insert(
            (consumer_group.to_string(), partition_id.to_string()),
            offset.to_string(),
        );
        Ok(())
    }

    async fn last_checkpoint(&self, consumer_group: &str, partition_id: &str) -> Result<Option<String>> {
        Ok(self
            .offsets
            .lock()
            .get(&(consumer_group.to_string(), partition_id.to_string()))
            .cloned())
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    offset: String,
    updated_at: DateTime<Utc>,
}

/// Checkpoint store keeping one small JSON blob per partition.
pub struct BlobCheckpointer<B> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: BlobBackend> BlobCheckpointer<B> {
    pub fn new(backend: Arc<B>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    fn blob_name(&self, consumer_group: &str, partition_id: &str) -> String {
        format!(
            "{}/{consumer_group}/{partition_id}.json",
            self.prefix.trim_end_matches('/')
        )
    }
}

impl<B: BlobBackend> Checkpointer for BlobCheckpointer<B> {
    async fn checkpoint(&self, consumer_group: &str, partition_id: &str, offset: &str) -> Result<()> {
        let name = self.blob_name(consumer_group, partition_id);
        let record = CheckpointRecord {
            offset: offset.to_string(),
            updated_at: Utc::now(),
        };
        let data = serde_json::to_vec(&record).context("encoding checkpoint")?;
        self.backend
            .put(&name, data, WriteCondition::Any)
            .await
            .with_context(|| format!("writing checkpoint {name}"))?;
        Ok(())
    }

    async fn last_checkpoint(&self, consumer_group: &str, partition_id: &str) -> Result<Option<String>> {
        let name = self.blob_name(consumer_group, partition_id);
        let Some(blob) = self
            .backend
            .get(&name)
            .await
            .with_context(|| format!("reading checkpoint {name}"))?
        else {
            return Ok(None);
        };
        let record: CheckpointRecord =
            serde_json::from_slice(&blob.data).with_context(|| format!("decoding checkpoint {name}"))?;
        Ok(Some(record.offset))
    }
}

/// Partition identity plus the handle used to checkpoint it.
pub struct PartitionContext<K> {
    consumer_group: String,
    partition_id: String,
    checkpointer: Arc<K>,
    last_offset: Option<String>,
}

impl<K: Checkpointer> PartitionContext<K> {
    pub fn new(
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
        checkpointer: Arc<K>,
    ) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            checkpointer,
            last_offset: None,
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Note `offset` as the latest message seen.
    pub fn record_offset(&mut self, offset: &str) {
        self.last_offset = Some(offset.to_string());
    }

    pub fn last_offset(&self) -> Option<&str> {
        self.last_offset.as_deref()
    }

    /// Persist the latest seen offset. Returns `false` if nothing has been
    /// seen yet.
    pub async fn checkpoint(&self) -> Result<bool> {
        let Some(offset) = self.last_offset.as_deref() else {
            return Ok(false);
        };
        self.checkpointer
            .checkpoint(&self.consumer_group, &self.partition_id, offset)
            .await?;
        Ok(true)
    }
}

/// A partition processor driven by a [`pump`](pump::run_partition).
pub trait EventProcessor: Send {
    /// Consumer label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn open<K: Checkpointer>(
        &mut self,
        ctx: &PartitionContext<K>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Handle one ordered batch. Per-message failures are logged, not returned.
    fn process_batch<K: Checkpointer>(
        &mut self,
        ctx: &mut PartitionContext<K>,
        messages: Vec<EventMessage>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn close<K: Checkpointer>(
        &mut self,
        ctx: &mut PartitionContext<K>,
        reason: CloseReason,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// State machine and counters shared by the processors.
pub struct ProcessorLifecycle {
    consumer: &'static str,
    state: ProcessorState,
    partition_id: Option<String>,
    opened_at: Option<Instant>,
    total_messages: u64,
    last_offset: Option<String>,
    received_after_close: bool,
    closed_tx: Option<oneshot::Sender<CloseReason>>,
    closed_rx: Option<oneshot::Receiver<CloseReason>>,
}

impl ProcessorLifecycle {
    pub fn new(consumer: &'static str) -> Self {
        let (closed_tx, closed_rx) = oneshot::channel();
        Self {
            consumer,
            state: ProcessorState::Created,
            partition_id: None,
            opened_at: None,
            total_messages: 0,
            last_offset: None,
            received_after_close: false,
            closed_tx: Some(closed_tx),
            closed_rx: Some(closed_rx),
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ProcessorState::Closed(_))
    }

    pub fn partition_id(&self) -> Option<&str> {
        self.partition_id.as_deref()
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Last processed offset, or [`NO_OFFSET`].
    pub fn last_offset(&self) -> &str {
        self.last_offset.as_deref().unwrap_or(NO_OFFSET)
    }

    /// Whether a batch arrived after the processor closed.
    pub fn received_after_close(&self) -> bool {
        self.received_after_close
    }

    /// Time since the partition was opened.
    pub fn uptime(&self) -> Option<Duration> {
        self.opened_at.map(|t| t.elapsed())
    }

    /// One-shot signal resolving with the close reason. Can be taken once.
    pub fn take_closed_signal(&mut self) -> Option<oneshot::Receiver<CloseReason>> {
        self.closed_rx.take()
    }

    pub fn on_open(&mut self, partition_id: &str, health: Option<&HealthMetrics>) {
        self.partition_id = Some(partition_id.to_string());
        self.opened_at = Some(Instant::now());
        self.state = ProcessorState::Opened;
        if let Some(health) = health {
            health
                .partitions_open
                .with_label_values(&[self.consumer])
                .inc();
        }
    }

    /// Enter a batch. Returns `false`, and flags the delivery, when the
    /// processor is already closed.
    pub fn begin_batch(&mut self, batch_len: usize, health: Option<&HealthMetrics>) -> bool {
        if self.is_closed() {
            self.received_after_close = true;
            if let Some(health) = health {
                health
                    .messages_after_close
                    .with_label_values(&[self.consumer])
                    .inc_by(batch_len as f64);
            }
            warn!(
                consumer = self.consumer,
                partition = self.partition_id().unwrap_or_default(),
                messages = batch_len,
                "batch delivered after close, not processing",
            );
            return false;
        }

        self.state = ProcessorState::Processing;
        true
    }

    pub fn record_message<K: Checkpointer>(
        &mut self,
        ctx: &mut PartitionContext<K>,
        message: &EventMessage,
        health: Option<&HealthMetrics>,
    ) {
        self.total_messages += 1;
        self.last_offset = Some(message.offset.clone());
        ctx.record_offset(&message.offset);
        if let Some(health) = health {
            health
                .messages_received
                .with_label_values(&[self.consumer])
                .inc();
        }
    }

    pub fn record_batch(&self, started: Instant, health: Option<&HealthMetrics>) {
        if let Some(health) = health {
            health
                .batches_processed
                .with_label_values(&[self.consumer])
                .inc();
            health
                .batch_duration
                .with_label_values(&[self.consumer])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    /// Checkpoint the partition, logging failures.
    pub async fn checkpoint<K: Checkpointer>(
        &mut self,
        ctx: &PartitionContext<K>,
        health: Option<&HealthMetrics>,
    ) {
        match ctx.checkpoint().await {
            Ok(true) => {
                if !self.is_closed() {
                    self.state = ProcessorState::Checkpointed;
                }
                debug!(
                    consumer = self.consumer,
                    partition = ctx.partition_id(),
                    offset = ctx.last_offset().unwrap_or(NO_OFFSET),
                    "checkpointed",
                );
            }
            Ok(false) => {}
            Err(e) => {
                if let Some(health) = health {
                    health
                        .checkpoint_errors
                        .with_label_values(&[self.consumer])
                        .inc();
                }
                warn!(
                    consumer = self.consumer,
                    partition = ctx.partition_id(),
                    error = %e,
                    "checkpoint failed",
                );
            }
        }
    }

    /// Mark closed and fire the completion signal.
    pub fn on_close(&mut self, reason: CloseReason, health: Option<&HealthMetrics>) {
        if self.is_closed() {
            return;
        }

        self.state = ProcessorState::Closed(reason);
        if let Some(tx) = self.closed_tx.take() {
            let _ = tx.send(reason);
        }
        if let Some(health) = health {
            health
                .partitions_open
                .with_label_values(&[self.consumer])
                .dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobBackend;

    #[tokio::test]
    async fn test_context_checkpoint_latest_offset() {
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let mut ctx = PartitionContext::new("ingestion", "0", Arc::clone(&checkpointer));

        assert!(!ctx.checkpoint().await.unwrap());

        ctx.record_offset("10");
        ctx.record_offset("11");
        assert!(ctx.checkpoint().await.unwrap());
        assert_eq!(
            checkpointer.last_checkpoint("ingestion", "0").await.unwrap(),
            Some("11".to_string())
        );
    }

    #[tokio::test]
    async fn test_blob_checkpointer_roundtrip() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let checkpointer = BlobCheckpointer::new(Arc::clone(&backend), "checkpoints/");

        assert!(checkpointer
            .last_checkpoint("feedback", "3")
            .await
            .unwrap()
            .is_none());
        checkpointer.checkpoint("feedback", "3", "42").await.unwrap();
        assert_eq!(
            checkpointer.last_checkpoint("feedback", "3").await.unwrap(),
            Some("42".to_string())
        );
        assert!(backend
            .get("checkpoints/feedback/3.json")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions_and_signal() {
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let mut ctx = PartitionContext::new("ingestion", "0", checkpointer);
        let mut lifecycle = ProcessorLifecycle::new("ingestion");
        let signal = lifecycle.take_closed_signal().unwrap();
        assert!(lifecycle.take_closed_signal().is_none());

        assert_eq!(lifecycle.state(), ProcessorState::Created);
        assert_eq!(lifecycle.last_offset(), NO_OFFSET);

        lifecycle.on_open("0", None);
        assert_eq!(lifecycle.state(), ProcessorState::Opened);

        assert!(lifecycle.begin_batch(1, None));
        lifecycle.record_message(&mut ctx, &EventMessage::new("5", b"[]".to_vec()), None);
        assert_eq!(lifecycle.state(), ProcessorState::Processing);

        lifecycle.checkpoint(&ctx, None).await;
        assert_eq!(lifecycle.state(), ProcessorState::Checkpointed);
        assert_eq!(lifecycle.total_messages(), 1);
        assert_eq!(lifecycle.last_offset(), "5");

        lifecycle.on_close(CloseReason::LeaseLost, None);
        assert_eq!(
            lifecycle.state(),
            ProcessorState::Closed(CloseReason::LeaseLost)
        );
        assert_eq!(signal.await.unwrap(), CloseReason::LeaseLost);

        assert!(!lifecycle.begin_batch(2, None));
        assert!(lifecycle.received_after_close());
    }

    #[tokio::test]
    async fn test_failed_checkpoint_keeps_state() {
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        checkpointer.set_failing(true);
        let mut ctx = PartitionContext::new("ingestion", "0", checkpointer);
        let mut lifecycle = ProcessorLifecycle::new("ingestion");
        lifecycle.on_open("0", None);
        lifecycle.begin_batch(1, None);
        lifecycle.record_message(&mut ctx, &EventMessage::new("1", Vec::new()), None);

        lifecycle.checkpoint(&ctx, None).await;
        assert_eq!(lifecycle.state(), ProcessorState::Processing);
    }

    #[test]
    fn test_checkpoint_policy_config_names() {
        let policy: CheckpointPolicy = serde_yaml::from_str("on_success").unwrap();
        assert_eq!(policy, CheckpointPolicy::OnSuccess);
        assert_eq!(CheckpointPolicy::default(), CheckpointPolicy::Always);
    }
}
