use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::LocationAggregate;
use crate::store::{BlobBackend, BlobError, WriteCondition};

/// Name suffixes tried before giving up on a free dead-letter name.
const PARK_ATTEMPTS: u32 = 16;

/// A batch whose merge failed, kept for later replay.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition_id: String,
    pub first_offset: String,
    pub last_offset: String,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
    pub deltas: Vec<LocationAggregate>,
}

/// Writes dead letters as blobs named
/// `{prefix}/{partition}/{last_offset}-{parked_at_millis}[-{n}].json`.
///
/// Offsets restart with the process, so names also carry the park time and
/// a letter is never written over an existing one.
pub struct DeadLetterWriter<B> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: BlobBackend> DeadLetterWriter<B> {
    pub fn new(backend: Arc<B>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Park a failed batch. Returns the blob name written.
    pub async fn park(&self, letter: &DeadLetter) -> Result<String> {
        let data = serde_json::to_vec(letter).context("encoding dead letter")?;
        let stem = format!(
            "{}/{}/{}-{}",
            self.prefix.trim_end_matches('/'),
            letter.partition_id,
            letter.last_offset,
            letter.parked_at.timestamp_millis()
        );

        for attempt in 0..PARK_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}-{attempt}.json")
            };

            match self
                .backend
                .put(&name, data.clone(), WriteCondition::IfNotExists)
                .await
            {
                Ok(_) => return Ok(name),
                Err(BlobError::Conflict { .. }) => continue,
                Err(e) => return Err(e).with_context(|| format!("writing dead letter {name}")),
            }
        }

        bail!("no free dead letter name under {stem} after {PARK_ATTEMPTS} attempts")
    }

    /// Names of all parked batches.
    pub async fn list(&self) -> Result<Vec<String>> {
        let prefix = format!("{}/", self.prefix.trim_end_matches('/'));
        Ok(self.backend.list(&prefix).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobBackend;
    use chrono::TimeZone;

    fn letter(partition: &str, first: &str, last: &str, reason: &str) -> DeadLetter {
        DeadLetter {
            partition_id: partition.to_string(),
            first_offset: first.to_string(),
            last_offset: last.to_string(),
            reason: reason.to_string(),
            parked_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            deltas: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_park_and_list() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let writer = DeadLetterWriter::new(Arc::clone(&backend), "deadletter");

        let name = writer.park(&letter("2", "7", "9", "conflict")).await.unwrap();

        assert_eq!(name, "deadletter/2/9-1714557600000.json");
        assert_eq!(writer.list().await.unwrap(), vec![name.clone()]);

        let blob = backend.get(&name).await.unwrap().unwrap();
        let letter: DeadLetter = serde_json::from_slice(&blob.data).unwrap();
        assert_eq!(letter.first_offset, "7");
    }

    #[tokio::test]
    async fn test_repeated_offset_keeps_both_letters() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let writer = DeadLetterWriter::new(Arc::clone(&backend), "deadletter/");

        let first = writer
            .park(&letter("0", "0", "0", "before restart"))
            .await
            .unwrap();
        let second = writer
            .park(&letter("0", "0", "0", "after restart"))
            .await
            .unwrap();
        assert_ne!(first, second);

        let names = writer.list().await.unwrap();
        assert_eq!(names.len(), 2);

        let mut reasons = Vec::new();
        for name in &names {
            let blob = backend.get(name).await.unwrap().unwrap();
            let parked: DeadLetter = serde_json::from_slice(&blob.data).unwrap();
            reasons.push(parked.reason);
        }
        reasons.sort();
        assert_eq!(reasons, vec!["after restart", "before restart"]);
    }
}
