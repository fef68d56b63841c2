use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::consumer::CheckpointPolicy;

/// Top-level configuration for the hazardwatch agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Blob storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Telemetry ingestion consumer configuration.
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Proximity feedback consumer configuration.
    #[serde(default)]
    pub feedback: FeedbackConfig,

    /// HTTP intake server configuration.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often to refresh the tracked-locations gauge. Default: 30s.
    #[serde(default = "default_snapshot_poll_interval", with = "humantime_serde")]
    pub snapshot_poll_interval: Duration,
}

/// Which blob backend holds the aggregate, rules and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Process memory; lost on restart.
    Memory,
    /// One file per blob under `data_dir`.
    #[default]
    Fs,
}

/// Blob storage configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Backend kind. Default: fs.
    #[serde(default)]
    pub backend: StorageKind,

    /// Root directory of the fs backend. Default: "./data".
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Blob holding the location aggregate dataset.
    #[serde(default = "default_aggregate_blob")]
    pub aggregate_blob: String,

    /// Blob holding the threshold rule table.
    #[serde(default = "default_rules_table_blob")]
    pub rules_table_blob: String,

    /// Blob receiving the enabled-rules projection.
    #[serde(default = "default_rules_projection_blob")]
    pub rules_projection_blob: String,

    /// Prefix under which failed ingestion batches are parked.
    #[serde(default = "default_dead_letter_prefix")]
    pub dead_letter_prefix: String,

    /// Prefix under which partition checkpoints are kept.
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,

    /// Prefix of the alert history segments.
    #[serde(default = "default_history_prefix")]
    pub history_prefix: String,
}

/// Telemetry ingestion consumer configuration.
#[derive(Debug, Deserialize)]
pub struct IngestionConfig {
    /// Consumer group used for checkpoints. Default: "ingestion".
    #[serde(default = "default_ingestion_group")]
    pub consumer_group: String,

    /// Number of partitions, identified "0".."n-1". Default: 4.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Queued messages per partition before intake rejects. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Messages per batch at most. Default: 64.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// When a batch advances the checkpoint. Default: always.
    #[serde(default)]
    pub checkpoint_policy: CheckpointPolicy,

    /// Extra merge attempts after a version conflict. Default: 3.
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,

    /// Park batches whose merge fails. Default: false.
    #[serde(default)]
    pub dead_letter: bool,
}

/// Proximity feedback consumer configuration.
#[derive(Debug, Deserialize)]
pub struct FeedbackConfig {
    /// Enable the feedback consumer. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Consumer group used for checkpoints. Default: "feedback".
    #[serde(default = "default_feedback_group")]
    pub consumer_group: String,

    /// Number of partitions, identified "0".."n-1". Default: 4.
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Queued messages per partition before intake rejects. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Messages per batch at most. Default: 64.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Hazards closer than this are reported. Default: 100.
    #[serde(default = "default_proximity_meters")]
    pub proximity_meters: f64,

    /// Device command channel.
    #[serde(default)]
    pub command: CommandConfig,
}

/// Device command channel configuration.
#[derive(Debug, Deserialize)]
pub struct CommandConfig {
    /// Base URL; messages go to `{endpoint}/devices/{id}/messages`.
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Static headers added to every request (e.g. authorization).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// HTTP intake server configuration.
#[derive(Debug, Deserialize)]
pub struct IntakeConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_intake_addr")]
    pub addr: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_snapshot_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_aggregate_blob() -> String {
    "aggregate/locations.json".to_string()
}

fn default_rules_table_blob() -> String {
    "rules/table.json".to_string()
}

fn default_rules_projection_blob() -> String {
    "rules/enabled.json".to_string()
}

fn default_dead_letter_prefix() -> String {
    "deadletter".to_string()
}

fn default_checkpoint_prefix() -> String {
    "checkpoints".to_string()
}

fn default_history_prefix() -> String {
    "alerts/".to_string()
}

fn default_ingestion_group() -> String {
    "ingestion".to_string()
}

fn default_feedback_group() -> String {
    "feedback".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_max_batch_size() -> usize {
    64
}

fn default_max_merge_retries() -> u32 {
    3
}

fn default_proximity_meters() -> f64 {
    100.0
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_intake_addr() -> String {
    ":8080".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            ingestion: IngestionConfig::default(),
            feedback: FeedbackConfig::default(),
            intake: IntakeConfig::default(),
            health: HealthConfig::default(),
            snapshot_poll_interval: default_snapshot_poll_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            data_dir: default_data_dir(),
            aggregate_blob: default_aggregate_blob(),
            rules_table_blob: default_rules_table_blob(),
            rules_projection_blob: default_rules_projection_blob(),
            dead_letter_prefix: default_dead_letter_prefix(),
            checkpoint_prefix: default_checkpoint_prefix(),
            history_prefix: default_history_prefix(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            consumer_group: default_ingestion_group(),
            partitions: default_partitions(),
            channel_capacity: default_channel_capacity(),
            max_batch_size: default_max_batch_size(),
            checkpoint_policy: CheckpointPolicy::default(),
            max_merge_retries: default_max_merge_retries(),
            dead_letter: false,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            consumer_group: default_feedback_group(),
            partitions: default_partitions(),
            channel_capacity: default_channel_capacity(),
            max_batch_size: default_max_batch_size(),
            proximity_meters: default_proximity_meters(),
            command: CommandConfig::default(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_command_timeout(),
            headers: HashMap::new(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            addr: default_intake_addr(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;

        validate_consumer(
            "ingestion",
            &self.ingestion.consumer_group,
            self.ingestion.partitions,
            self.ingestion.channel_capacity,
            self.ingestion.max_batch_size,
        )?;

        if self.feedback.enabled {
            validate_consumer(
                "feedback",
                &self.feedback.consumer_group,
                self.feedback.partitions,
                self.feedback.channel_capacity,
                self.feedback.max_batch_size,
            )?;

            if !self.feedback.proximity_meters.is_finite() || self.feedback.proximity_meters <= 0.0 {
                bail!("feedback.proximity_meters must be a positive number");
            }

            let endpoint = &self.feedback.command.endpoint;
            if endpoint.is_empty() {
                bail!("feedback.command.endpoint is required when feedback is enabled");
            }
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                bail!("feedback.command.endpoint must be an http(s) URL, got {endpoint:?}");
            }
            if self.feedback.command.timeout.is_zero() {
                bail!("feedback.command.timeout must be positive");
            }
        }

        if self.snapshot_poll_interval.is_zero() {
            bail!("snapshot_poll_interval must be positive");
        }

        Ok(())
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.backend == StorageKind::Fs && self.data_dir.as_os_str().is_empty() {
            bail!("storage.data_dir is required for the fs backend");
        }

        let names = [
            ("storage.aggregate_blob", &self.aggregate_blob),
            ("storage.rules_table_blob", &self.rules_table_blob),
            ("storage.rules_projection_blob", &self.rules_projection_blob),
            ("storage.dead_letter_prefix", &self.dead_letter_prefix),
            ("storage.checkpoint_prefix", &self.checkpoint_prefix),
            ("storage.history_prefix", &self.history_prefix),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                bail!("{field} must not be empty");
            }
        }

        if self.aggregate_blob == self.rules_table_blob
            || self.aggregate_blob == self.rules_projection_blob
            || self.rules_table_blob == self.rules_projection_blob
        {
            bail!("storage blob names must be distinct");
        }

        Ok(())
    }
}

fn validate_consumer(
    section: &str,
    consumer_group: &str,
    partitions: u32,
    channel_capacity: usize,
    max_batch_size: usize,
) -> Result<()> {
    if consumer_group.is_empty() {
        bail!("{section}.consumer_group is required");
    }
    if partitions == 0 {
        bail!("{section}.partitions must be positive");
    }
    if channel_capacity == 0 {
        bail!("{section}.channel_capacity must be positive");
    }
    if max_batch_size == 0 {
        bail!("{section}.max_batch_size must be positive");
    }
    Ok(())
}

/// Partition ids "0".."n-1".
pub fn partition_ids(partitions: u32) -> Vec<String> {
    (0..partitions).map(|p| p.to_string()).collect()
}
