//! Rule Registry: per-region threshold rules with a write-time uniqueness
//! check and a derived projection of enabled rules.

pub mod projection;
pub mod table;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::store::BlobBackend;
use projection::ProjectionWriter;
pub use table::{BlobRuleTable, RuleTable, TableError};

/// Region id and rule id of the catch-all rule.
pub const DEFAULT_REGION_ID: &str = "default";

/// A threshold rule for one coordinate in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub rule_id: String,
    pub region_id: String,
    /// Display label of the region.
    #[serde(default)]
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub vertical_threshold: f64,
    #[serde(default)]
    pub lateral_threshold: f64,
    #[serde(default)]
    pub forward_threshold: f64,
    #[serde(default)]
    pub rule_output: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub etag: String,
}

fn default_enabled() -> bool {
    true
}

impl ThresholdRule {
    /// The catch-all rule applied where no regional rule exists.
    pub fn catch_all() -> Self {
        Self {
            rule_id: DEFAULT_REGION_ID.to_string(),
            region_id: DEFAULT_REGION_ID.to_string(),
            region: "All".to_string(),
            latitude: 300.0,
            longitude: 300.0,
            vertical_threshold: 25.05,
            lateral_threshold: 20.0,
            forward_threshold: 15.8,
            rule_output: "DefaultJerk".to_string(),
            enabled: true,
            etag: String::new(),
        }
    }

    /// An unsaved rule at a coordinate truncated to two decimals.
    /// Thresholds are zero and the rule id is left for the caller.
    pub fn draft(region_id: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            rule_id: String::new(),
            region_id: region_id.to_string(),
            region: String::new(),
            latitude: truncate_to(latitude, 2),
            longitude: truncate_to(longitude, 2),
            vertical_threshold: 0.0,
            lateral_threshold: 0.0,
            forward_threshold: 0.0,
            rule_output: String::new(),
            enabled: true,
            etag: String::new(),
        }
    }
}

/// Errors from the rule registry.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(
        "rule {:?} does not belong to region {:?}",
        .rule.rule_id,
        .rule.region_id
    )]
    IncorrectEntry { rule: Box<ThresholdRule> },

    #[error(
        "region {} already has rule {:?} at these coordinates",
        .existing.region_id,
        .existing.rule_id
    )]
    DuplicateInsert { existing: Box<ThresholdRule> },

    #[error("rule {region_id}/{rule_id} was modified concurrently")]
    Conflict { region_id: String, rule_id: String },

    #[error("rule {region_id}/{rule_id} not found")]
    NotFound { region_id: String, rule_id: String },

    #[error(transparent)]
    Storage(TableError),
}

impl From<TableError> for RuleError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::Conflict { region_id, rule_id } => Self::Conflict { region_id, rule_id },
            other => Self::Storage(other),
        }
    }
}

/// Truncate toward zero to `decimals` places.
pub fn truncate_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).trunc() / scale
}

/// Canonical region id: both coordinates truncated to one decimal,
/// printed with one decimal and joined by `_`.
pub fn region_id_for(latitude: f64, longitude: f64) -> String {
    // Adding 0.0 turns -0.0 into 0.0 so it prints without a sign.
    let lat = truncate_to(latitude, 1) + 0.0;
    let lng = truncate_to(longitude, 1) + 0.0;
    format!("{lat:.1}_{lng:.1}")
}

/// Registry of threshold rules over a [`RuleTable`].
pub struct RuleRegistry<T, B> {
    table: Arc<T>,
    projection: ProjectionWriter<B>,
    health: Option<Arc<HealthMetrics>>,
}

impl<T: RuleTable, B: BlobBackend> RuleRegistry<T, B> {
    pub fn new(table: Arc<T>, projection: ProjectionWriter<B>) -> Self {
        Self {
            table,
            projection,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn list_all(&self) -> Result<Vec<ThresholdRule>, RuleError> {
        Ok(self.table.query_all().await?)
    }

    pub async fn list_for_region(&self, region_id: &str) -> Result<Vec<ThresholdRule>, RuleError> {
        Ok(self.table.query_region(region_id).await?)
    }

    pub async fn get_rule(&self, region_id: &str, rule_id: &str) -> Result<ThresholdRule, RuleError> {
        self.table
            .get(region_id, rule_id)
            .await?
            .ok_or_else(|| RuleError::NotFound {
                region_id: region_id.to_string(),
                rule_id: rule_id.to_string(),
            })
    }

    /// The rule stored at exactly this coordinate in the region, or an
    /// unsaved draft. A draft is persisted only by [`save`](Self::save).
    pub async fn rule_for_coordinate(
        &self,
        region_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<ThresholdRule, RuleError> {
        let found = self
            .table
            .query_region(region_id)
            .await?
            .into_iter()
            .find(|r| r.latitude == latitude && r.longitude == longitude);

        Ok(found.unwrap_or_else(|| ThresholdRule::draft(region_id, latitude, longitude)))
    }

    /// The catch-all rule, created and saved on first use.
    pub async fn default_rule(&self) -> Result<ThresholdRule, RuleError> {
        if let Some(rule) = self.table.get(DEFAULT_REGION_ID, DEFAULT_REGION_ID).await? {
            return Ok(rule);
        }

        info!("creating default threshold rule");
        self.save(ThresholdRule::catch_all()).await
    }

    /// Validate and store a rule, then regenerate the projection.
    ///
    /// Rules in the default region skip validation. Otherwise the region id
    /// must equal [`region_id_for`] the rule's coordinates, the rule id must
    /// be non-blank, and no other rule in the region may sit at the same
    /// coordinates.
    pub async fn save(&self, rule: ThresholdRule) -> Result<ThresholdRule, RuleError> {
        if rule.region_id != DEFAULT_REGION_ID {
            let expected = region_id_for(rule.latitude, rule.longitude);
            if rule.region_id != expected || rule.rule_id.trim().is_empty() {
                return Err(RuleError::IncorrectEntry {
                    rule: Box::new(rule),
                });
            }

            let duplicate = self
                .table
                .query_region(&rule.region_id)
                .await?
                .into_iter()
                .find(|r| {
                    r.rule_id != rule.rule_id
                        && r.latitude == rule.latitude
                        && r.longitude == rule.longitude
                });
            if let Some(existing) = duplicate {
                return Err(RuleError::DuplicateInsert {
                    existing: Box::new(existing),
                });
            }
        }

        let stored = self.table.upsert(rule).await?;
        debug!(
            region_id = %stored.region_id,
            rule_id = %stored.rule_id,
            enabled = stored.enabled,
            "saved threshold rule",
        );

        self.refresh_projection().await;
        Ok(stored)
    }

    /// Flip only the enabled flag of a stored rule.
    pub async fn set_enabled(
        &self,
        region_id: &str,
        rule_id: &str,
        enabled: bool,
    ) -> Result<ThresholdRule, RuleError> {
        let mut rule = self.get_rule(region_id, rule_id).await?;
        rule.enabled = enabled;
        self.save(rule).await
    }

    pub async fn delete(&self, region_id: &str, rule_id: &str) -> Result<(), RuleError> {
        let rule = self.get_rule(region_id, rule_id).await?;
        let removed = self.table.delete(region_id, rule_id, &rule.etag).await?;
        if !removed {
            return Err(RuleError::NotFound {
                region_id: region_id.to_string(),
                rule_id: rule_id.to_string(),
            });
        }

        debug!(region_id, rule_id, "deleted threshold rule");
        self.refresh_projection().await;
        Ok(())
    }

    /// Rewrite the enabled-rules projection from the table.
    pub async fn regenerate_projection(&self) -> anyhow::Result<usize> {
        let rules = self.table.query_all().await?;
        self.projection.write(&rules).await
    }

    /// The table write already succeeded; a failed projection is logged
    /// and rebuilt on the next mutation.
    async fn refresh_projection(&self) {
        match self.regenerate_projection().await {
            Ok(count) => debug!(
                blob = %self.projection.blob_name(),
                rules = count,
                "regenerated enabled-rules projection",
            ),
            Err(e) => {
                if let Some(health) = &self.health {
                    health.rule_projection_errors.inc();
                }
                warn!(error = %e, "failed to regenerate enabled-rules projection");
            }
        }
    }
}
