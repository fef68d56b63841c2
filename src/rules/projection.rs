//! Flat "enabled rules" reference data consumed outside the pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::ThresholdRule;
use crate::store::{BlobBackend, WriteCondition};

/// One projected rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedRule {
    /// `"{latitude}_{longitude}"` of the rule.
    pub id: String,
    pub region_latitude: f64,
    pub region_longitude: f64,
    pub vertical_threshold: f64,
    pub lateral_threshold: f64,
    pub forward_threshold: f64,
    pub rule_output: String,
}

impl From<&ThresholdRule> for ProjectedRule {
    fn from(rule: &ThresholdRule) -> Self {
        Self {
            id: format!("{}_{}", rule.latitude, rule.longitude),
            region_latitude: rule.latitude,
            region_longitude: rule.longitude,
            vertical_threshold: rule.vertical_threshold,
            lateral_threshold: rule.lateral_threshold,
            forward_threshold: rule.forward_threshold,
            rule_output: rule.rule_output.clone(),
        }
    }
}

/// Project enabled rules, one entry per (regionId, ruleId), in key order.
pub fn project(rules: &[ThresholdRule]) -> Vec<ProjectedRule> {
    let mut by_key: BTreeMap<(&str, &str), ProjectedRule> = BTreeMap::new();
    for rule in rules.iter().filter(|r| r.enabled) {
        by_key
            .entry((rule.region_id.as_str(), rule.rule_id.as_str()))
            .or_insert_with(|| ProjectedRule::from(rule));
    }
    by_key.into_values().collect()
}

/// Writes the projection to a blob, replacing the previous one.
pub struct ProjectionWriter<B> {
    backend: Arc<B>,
    blob_name: String,
}

impl<B: BlobBackend> ProjectionWriter<B> {
    pub fn new(backend: Arc<B>, blob_name: impl Into<String>) -> Self {
        Self {
            backend,
            blob_name: blob_name.into(),
        }
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Replace the projection blob. Returns the number of projected rules.
    pub async fn write(&self, rules: &[ThresholdRule]) -> Result<usize> {
        let projected = project(rules);
        let data = serde_json::to_vec(&projected).context("encoding rule projection")?;
        self.backend
            .put(&self.blob_name, data, WriteCondition::Any)
            .await
            .with_context(|| format!("writing rule projection {}", self.blob_name))?;
        Ok(projected.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobBackend;

    fn rule(region_id: &str, rule_id: &str, enabled: bool) -> ThresholdRule {
        ThresholdRule {
            rule_id: rule_id.to_string(),
            region_id: region_id.to_string(),
            region: "WA".to_string(),
            latitude: 47.61,
            longitude: -122.33,
            vertical_threshold: 25.0,
            lateral_threshold: 20.0,
            forward_threshold: 15.0,
            rule_output: "Pothole".to_string(),
            enabled,
            etag: String::new(),
        }
    }

    #[test]
    fn test_project_keeps_enabled_only() {
        let rules = vec![
            rule("47.6_-122.3", "A", true),
            rule("47.6_-122.3", "B", false),
            rule("47.6_-122.3", "A", true),
        ];
        let projected = project(&rules);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].id, "47.61_-122.33");
        assert_eq!(projected[0].rule_output, "Pothole");
    }

    #[tokio::test]
    async fn test_writer_replaces_blob() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let writer = ProjectionWriter::new(Arc::clone(&backend), "rules/enabled.json");

        writer
            .write(&[rule("47.6_-122.3", "A", true)])
            .await
            .unwrap();
        let count = writer.write(&[]).await.unwrap();
        assert_eq!(count, 0);

        let blob = backend.get("rules/enabled.json").await.unwrap().unwrap();
        let stored: Vec<ProjectedRule> = serde_json::from_slice(&blob.data).unwrap();
        assert!(stored.is_empty());
    }
}
