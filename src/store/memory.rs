use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{Blob, BlobBackend, BlobError, Version, WriteCondition};

/// In-process blob backend. Versions come from a monotonically
/// increasing write sequence.
#[derive(Default)]
pub struct MemoryBlobBackend {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    blobs: BTreeMap<String, Blob>,
    sequence: u64,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobBackend for MemoryBlobBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, name: &str) -> Result<Option<Blob>, BlobError> {
        Ok(self.inner.lock().blobs.get(name).cloned())
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<Version, BlobError> {
        if name.is_empty() {
            return Err(BlobError::InvalidName {
                name: name.to_string(),
            });
        }

        let mut state = self.inner.lock();
        let current = state.blobs.get(name).map(|b| &b.version);
        if !condition.permits(current) {
            return Err(BlobError::Conflict {
                name: name.to_string(),
            });
        }

        state.sequence += 1;
        let version = Version::new(format!("\"0x{:016X}\"", state.sequence));
        state.blobs.insert(
            name.to_string(),
            Blob {
                data,
                version: version.clone(),
            },
        );

        Ok(version)
    }

    async fn delete(&self, name: &str) -> Result<bool, BlobError> {
        Ok(self.inner.lock().blobs.remove(name).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        Ok(self
            .inner
            .lock()
            .blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_writes() {
        let backend = MemoryBlobBackend::new();

        let v1 = backend
            .put("agg.json", b"[]".to_vec(), WriteCondition::IfNotExists)
            .await
            .unwrap();

        let err = backend
            .put("agg.json", b"[1]".to_vec(), WriteCondition::IfNotExists)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Conflict { .. }));

        let v2 = backend
            .put("agg.json", b"[1]".to_vec(), WriteCondition::IfMatch(v1.clone()))
            .await
            .unwrap();
        assert_ne!(v1, v2);

        let err = backend
            .put("agg.json", b"[2]".to_vec(), WriteCondition::IfMatch(v1))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Conflict { .. }));

        let blob = backend.get("agg.json").await.unwrap().unwrap();
        assert_eq!(blob.data, b"[1]");
        assert_eq!(blob.version, v2);
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let backend = MemoryBlobBackend::new();
        for name in ["alerts/2024/02.csv", "alerts/2024/01.csv", "rules.json"] {
            backend
                .put(name, Vec::new(), WriteCondition::Any)
                .await
                .unwrap();
        }

        assert_eq!(
            backend.list("alerts/").await.unwrap(),
            vec![
                "alerts/2024/01.csv".to_string(),
                "alerts/2024/02.csv".to_string()
            ]
        );
        assert_eq!(backend.len(), 3);

        assert!(backend.delete("rules.json").await.unwrap());
        assert!(!backend.delete("rules.json").await.unwrap());
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let backend = MemoryBlobBackend::new();
        let err = backend
            .put("", Vec::new(), WriteCondition::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidName { .. }));
    }
}
