//! Keyed rule table: partition key = region id, row key = rule id, with a
//! per-row etag.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ThresholdRule;
use crate::store::{BlobBackend, BlobError, WriteCondition};

/// Attempts at the whole-table conditional write before giving up.
const TABLE_WRITE_ATTEMPTS: u32 = 5;

/// Errors from a rule table.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("etag mismatch for rule {region_id}/{rule_id}")]
    Conflict { region_id: String, rule_id: String },

    #[error("rule table {name} is not valid JSON: {source}")]
    Format {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] BlobError),
}

/// Table-like storage for threshold rules.
pub trait RuleTable: Send + Sync {
    /// Every stored rule.
    fn query_all(&self) -> impl Future<Output = Result<Vec<ThresholdRule>, TableError>> + Send;

    /// All rules in one region.
    fn query_region(
        &self,
        region_id: &str,
    ) -> impl Future<Output = Result<Vec<ThresholdRule>, TableError>> + Send;

    /// Point lookup by key.
    fn get(
        &self,
        region_id: &str,
        rule_id: &str,
    ) -> impl Future<Output = Result<Option<ThresholdRule>, TableError>> + Send;

    /// Insert or replace a row. A non-empty `rule.etag` must match the
    /// stored row. Returns the stored row with its new etag.
    fn upsert(
        &self,
        rule: ThresholdRule,
    ) -> impl Future<Output = Result<ThresholdRule, TableError>> + Send;

    /// Delete a row. A non-empty `etag` must match the stored row.
    /// Returns whether a row was removed.
    fn delete(
        &self,
        region_id: &str,
        rule_id: &str,
        etag: &str,
    ) -> impl Future<Output = Result<bool, TableError>> + Send;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableDocument {
    sequence: u64,
    rows: Vec<ThresholdRule>,
}

impl TableDocument {
    fn position(&self, region_id: &str, rule_id: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.region_id == region_id && r.rule_id == rule_id)
    }

    fn next_etag(&mut self) -> String {
        self.sequence += 1;
        format!("W/\"{}\"", self.sequence)
    }
}

/// Rule table stored as a single JSON document on a [`BlobBackend`].
///
/// Row etags come from a table-wide sequence. Each mutation is a
/// read-modify-conditional-write of the whole document, retried when
/// another writer got in first.
pub struct BlobRuleTable<B> {
    backend: Arc<B>,
    blob_name: String,
}

impl<B: BlobBackend> BlobRuleTable<B> {
    pub fn new(backend: Arc<B>, blob_name: impl Into<String>) -> Self {
        Self {
            backend,
            blob_name: blob_name.into(),
        }
    }

    async fn load(&self) -> Result<(TableDocument, WriteCondition), TableError> {
        let Some(blob) = self.backend.get(&self.blob_name).await? else {
            return Ok((TableDocument::default(), WriteCondition::IfNotExists));
        };

        let doc = if blob.data.iter().all(u8::is_ascii_whitespace) {
            TableDocument::default()
        } else {
            serde_json::from_slice(&blob.data).map_err(|source| TableError::Format {
                name: self.blob_name.clone(),
                source,
            })?
        };

        Ok((doc, WriteCondition::IfMatch(blob.version)))
    }

    /// Apply `mutate` to the document and write it back conditionally.
    async fn mutate<T, F>(&self, mut mutate: F) -> Result<T, TableError>
    where
        F: FnMut(&mut TableDocument) -> Result<Mutation<T>, TableError>,
    {
        let mut attempt = 1;
        loop {
            let (mut doc, condition) = self.load().await?;
            let result = match mutate(&mut doc)? {
                Mutation::Unchanged(result) => return Ok(result),
                Mutation::Changed(result) => result,
            };

            let data = serde_json::to_vec(&doc).map_err(|source| TableError::Format {
                name: self.blob_name.clone(),
                source,
            })?;

            match self.backend.put(&self.blob_name, data, condition).await {
                Ok(_) => return Ok(result),
                Err(BlobError::Conflict { .. }) if attempt < TABLE_WRITE_ATTEMPTS => {
                    debug!(table = %self.blob_name, attempt, "rule table changed, retrying write");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Outcome of a document mutation.
enum Mutation<T> {
    Changed(T),
    Unchanged(T),
}

fn etag_matches(expected: &str, stored: &ThresholdRule) -> bool {
    expected.is_empty() || expected == stored.etag
}

impl<B: BlobBackend> RuleTable for BlobRuleTable<B> {
    async fn query_all(&self) -> Result<Vec<ThresholdRule>, TableError> {
        Ok(self.load().await?.0.rows)
    }

    async fn query_region(&self, region_id: &str) -> Result<Vec<ThresholdRule>, TableError> {
        let (doc, _) = self.load().await?;
        Ok(doc
            .rows
            .into_iter()
            .filter(|r| r.region_id == region_id)
            .collect())
    }

    async fn get(
        &self,
        region_id: &str,
        rule_id: &str,
    ) -> Result<Option<ThresholdRule>, TableError> {
        let (doc, _) = self.load().await?;
        Ok(doc
            .rows
            .into_iter()
            .find(|r| r.region_id == region_id && r.rule_id == rule_id))
    }

    async fn upsert(&self, rule: ThresholdRule) -> Result<ThresholdRule, TableError> {
        self.mutate(|doc| {
            let existing = doc.position(&rule.region_id, &rule.rule_id);
            if let Some(idx) = existing {
                if !etag_matches(&rule.etag, &doc.rows[idx]) {
                    return Err(TableError::Conflict {
                        region_id: rule.region_id.clone(),
                        rule_id: rule.rule_id.clone(),
                    });
                }
            }

            let mut row = rule.clone();
            row.etag = doc.next_etag();
            match existing {
                Some(idx) => doc.rows[idx] = row.clone(),
                None => doc.rows.push(row.clone()),
            }
            Ok(Mutation::Changed(row))
        })
        .await
    }

    async fn delete(&self, region_id: &str, rule_id: &str, etag: &str) -> Result<bool, TableError> {
        self.mutate(|doc| {
            let Some(idx) = doc.position(region_id, rule_id) else {
                return Ok(Mutation::Unchanged(false));
            };
            if !etag_matches(etag, &doc.rows[idx]) {
                return Err(TableError::Conflict {
                    region_id: region_id.to_string(),
                    rule_id: rule_id.to_string(),
                });
            }
            doc.rows.remove(idx);
            Ok(Mutation::Changed(true))
        })
        .await
    }
}
