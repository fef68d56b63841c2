pub mod intake;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::intake::{IntakeFeeds, IntakeServer, PartitionFeed, Stream};
use crate::config::{partition_ids, Config, StorageConfig, StorageKind};
use crate::consumer::command::{CommandClient, HttpCommandChannel};
use crate::consumer::dead_letter::DeadLetterWriter;
use crate::consumer::feedback::FeedbackProcessor;
use crate::consumer::ingestion::{IngestionProcessor, IngestionSettings};
use crate::consumer::pump::run_partition;
use crate::consumer::{BlobCheckpointer, EventMessage, EventProcessor, PartitionContext};
use crate::export::health::HealthMetrics;
use crate::history::{AlertHistoryReader, BlobSegmentSource};
use crate::rules::projection::ProjectionWriter;
use crate::rules::table::BlobRuleTable;
use crate::rules::RuleRegistry;
use crate::store::{FsBlobBackend, LocationAggregateStore, MemoryBlobBackend, StorageBackend};

/// Rule registry over the configured backend.
pub type Registry = RuleRegistry<BlobRuleTable<StorageBackend>, StorageBackend>;

/// Open the configured blob backend.
pub fn open_backend(cfg: &StorageConfig) -> StorageBackend {
    match cfg.backend {
        StorageKind::Memory => {
            info!("using in-memory blob storage, data is lost on exit");
            StorageBackend::Memory(MemoryBlobBackend::new())
        }
        StorageKind::Fs => {
            let fs = FsBlobBackend::new(&cfg.data_dir);
            info!(root = %fs.root().display(), "using filesystem blob storage");
            StorageBackend::Fs(fs)
        }
    }
}

/// Location aggregate store over `backend`.
pub fn aggregate_store(
    backend: Arc<StorageBackend>,
    cfg: &StorageConfig,
) -> LocationAggregateStore<StorageBackend> {
    LocationAggregateStore::new(backend, &cfg.aggregate_blob)
}

/// Rule registry over `backend`.
pub fn rule_registry(backend: Arc<StorageBackend>, cfg: &StorageConfig) -> Registry {
    let table = BlobRuleTable::new(Arc::clone(&backend), &cfg.rules_table_blob);
    let projection = ProjectionWriter::new(backend, &cfg.rules_projection_blob);
    RuleRegistry::new(Arc::new(table), projection)
}

/// Alert history reader over `backend`.
pub fn history_reader(
    backend: Arc<StorageBackend>,
    cfg: &StorageConfig,
) -> AlertHistoryReader<BlobSegmentSource<StorageBackend>> {
    AlertHistoryReader::new(BlobSegmentSource::new(backend, &cfg.history_prefix))
}

/// Agent orchestrates all components: health server, consumers, intake.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    backend: Arc<StorageBackend>,
    store: Arc<LocationAggregateStore<StorageBackend>>,
    intake: Option<IntakeServer>,
    pumps: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics and storage.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let backend = Arc::new(open_backend(&cfg.storage));
        let store = Arc::new(
            aggregate_store(Arc::clone(&backend), &cfg.storage).with_health(Arc::clone(&health)),
        );

        Ok(Self {
            cfg,
            health,
            backend,
            store,
            intake: None,
            pumps: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin consuming.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Make sure the catch-all rule exists.
        let registry = rule_registry(Arc::clone(&self.backend), &self.cfg.storage)
            .with_health(Arc::clone(&self.health));
        let default_rule = registry
            .default_rule()
            .await
            .context("ensuring default threshold rule")?;
        debug!(rule_output = %default_rule.rule_output, "default rule ready");

        // 2. Seed the tracked-locations gauge (continue even if it fails).
        match self.store.load_snapshot().await {
            Ok(snapshot) => {
                self.health
                    .locations_tracked
                    .set(snapshot.locations.len() as f64);
                info!(locations = snapshot.locations.len(), "loaded location aggregate");
            }
            Err(e) => warn!(error = %e, "failed to load location aggregate"),
        }

        let checkpointer = Arc::new(BlobCheckpointer::new(
            Arc::clone(&self.backend),
            &self.cfg.storage.checkpoint_prefix,
        ));
        let mut feeds = IntakeFeeds::new();

        // 3. Ingestion pumps, one per partition.
        let dead_letters = self.cfg.ingestion.dead_letter.then(|| {
            Arc::new(DeadLetterWriter::new(
                Arc::clone(&self.backend),
                &self.cfg.storage.dead_letter_prefix,
            ))
        });
        let settings = IngestionSettings {
            checkpoint_policy: self.cfg.ingestion.checkpoint_policy,
            max_merge_retries: self.cfg.ingestion.max_merge_retries,
        };
        for partition in partition_ids(self.cfg.ingestion.partitions) {
            let mut processor = IngestionProcessor::new(Arc::clone(&self.store), settings.clone())
                .with_health(Arc::clone(&self.health));
            if let Some(writer) = &dead_letters {
                processor = processor.with_dead_letters(Arc::clone(writer));
            }

            let (tx, rx) = mpsc::channel(self.cfg.ingestion.channel_capacity);
            feeds.add(Stream::Telemetry, PartitionFeed::new(&partition, tx));
            let ctx = PartitionContext::new(
                &self.cfg.ingestion.consumer_group,
                &partition,
                Arc::clone(&checkpointer),
            );
            self.spawn_pump(processor, ctx, rx, self.cfg.ingestion.max_batch_size);
        }

        // 4. Feedback pumps, sharing one command channel.
        if self.cfg.feedback.enabled {
            let command = &self.cfg.feedback.command;
            let channel = Arc::new(CommandClient::Http(
                HttpCommandChannel::new(&command.endpoint, command.timeout, command.headers.clone())
                    .context("creating device command channel")?,
            ));

            for partition in partition_ids(self.cfg.feedback.partitions) {
                let processor = FeedbackProcessor::new(Arc::clone(&self.store), Arc::clone(&channel))
                    .with_proximity(self.cfg.feedback.proximity_meters)
                    .with_health(Arc::clone(&self.health));

                let (tx, rx) = mpsc::channel(self.cfg.feedback.channel_capacity);
                feeds.add(Stream::Positions, PartitionFeed::new(&partition, tx));
                let ctx = PartitionContext::new(
                    &self.cfg.feedback.consumer_group,
                    &partition,
                    Arc::clone(&checkpointer),
                );
                self.spawn_pump(processor, ctx, rx, self.cfg.feedback.max_batch_size);
            }
        }

        // 5. Intake server feeding the pumps.
        let intake = IntakeServer::new(&self.cfg.intake.addr, feeds, Some(Arc::clone(&self.health)));
        intake.start().await.context("starting intake server")?;
        self.intake = Some(intake);

        // 6. Background monitors.
        self.spawn_snapshot_monitor();

        info!(
            ingestion_partitions = self.cfg.ingestion.partitions,
            feedback_enabled = self.cfg.feedback.enabled,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop accepting events first.
        if let Some(intake) = &self.intake {
            intake.stop();
        }

        // Signal pumps and monitors; in-flight batches finish.
        self.cancel.cancel();

        for pump in self.pumps.drain(..) {
            if let Err(e) = pump.await {
                error!(error = %e, "partition pump task failed");
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    fn spawn_pump<P>(
        &mut self,
        processor: P,
        ctx: PartitionContext<BlobCheckpointer<StorageBackend>>,
        rx: mpsc::Receiver<EventMessage>,
        max_batch_size: usize,
    ) where
        P: EventProcessor + 'static,
    {
        let cancel = self.cancel.clone();
        let partition = ctx.partition_id().to_string();
        let consumer = processor.name();

        self.pumps.push(tokio::spawn(async move {
            if let Err(e) = run_partition(processor, ctx, rx, max_batch_size, cancel).await {
                error!(consumer, partition = %partition, error = %e, "partition pump exited with error");
            }
        }));
    }

    /// Spawn background tracked-locations refresher.
    fn spawn_snapshot_monitor(&self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let store = Arc::clone(&self.store);
        let poll_interval = self.cfg.snapshot_poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.load_snapshot().await {
                            Ok(snapshot) => {
                                health.locations_tracked.set(snapshot.locations.len() as f64);
                            }
                            Err(e) => {
                                warn!(error = %e, "location aggregate poll failed");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, IntakeConfig};
    use std::time::Duration;

    fn memory_config() -> Config {
        let mut cfg = Config {
            intake: IntakeConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            health: HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Default::default()
        };
        cfg.storage.backend = StorageKind::Memory;
        cfg.ingestion.partitions = 2;
        cfg.snapshot_poll_interval = Duration::from_millis(50);
        cfg
    }

    #[tokio::test]
    async fn test_agent_start_creates_default_rule_and_stops() {
        let mut agent = Agent::new(memory_config()).unwrap();
        agent.start().await.unwrap();

        let registry = rule_registry(Arc::clone(&agent.backend), &agent.cfg.storage);
        let rule = registry.default_rule().await.unwrap();
        assert_eq!(rule.region_id, "default");
        assert_eq!(registry.list_all().await.unwrap().len(), 1);

        agent.stop().await.unwrap();
        assert!(agent.pumps.is_empty());
    }
}
