//! Versioned blob storage shared by the aggregate store, the rule table,
//! checkpoints, dead letters and the alert history reader.

pub mod aggregate;
pub mod fs;
pub mod memory;

use std::future::Future;

use serde::{Deserialize, Serialize};

pub use aggregate::{AggregateSnapshot, LocationAggregateStore, StoreError};
pub use fs::FsBlobBackend;
pub use memory::MemoryBlobBackend;

/// Opaque version token of a stored blob (an ETag).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Precondition attached to a blob write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Overwrite whatever is stored.
    Any,
    /// Succeed only if the stored version still matches.
    IfMatch(Version),
    /// Succeed only if no blob exists yet.
    IfNotExists,
}

impl WriteCondition {
    /// Condition that keeps a write conditional on what was read.
    pub fn from_read(version: Option<&Version>) -> Self {
        match version {
            Some(v) => Self::IfMatch(v.clone()),
            None => Self::IfNotExists,
        }
    }

    /// Whether a write may proceed given the currently stored version.
    pub fn permits(&self, current: Option<&Version>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::IfMatch(expected), Some(actual)) => expected == actual,
            (Self::IfMatch(_), None) => false,
            (Self::IfNotExists, current) => current.is_none(),
        }
    }
}

/// Blob contents with the version they were read at.
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    pub version: Version,
}

/// Errors from a blob backend.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("write precondition failed for blob {name}")]
    Conflict { name: String },

    #[error("invalid blob name: {name:?}")]
    InvalidName { name: String },

    #[error("i/o error on blob {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Named blob storage with conditional writes.
pub trait BlobBackend: Send + Sync {
    /// Returns the backend's name for logging.
    fn name(&self) -> &str;

    /// Read a blob, or `None` if it does not exist.
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<Blob>, BlobError>> + Send;

    /// Write a blob if `condition` holds, returning the new version.
    fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> impl Future<Output = Result<Version, BlobError>> + Send;

    /// Delete a blob, returning whether it existed.
    fn delete(&self, name: &str) -> impl Future<Output = Result<bool, BlobError>> + Send;

    /// Names of all blobs starting with `prefix`, in ascending order.
    fn list(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, BlobError>> + Send;
}

/// Storage backend selected by configuration.
///
/// Enum dispatch keeps the async trait methods statically dispatched.
pub enum StorageBackend {
    Memory(MemoryBlobBackend),
    Fs(FsBlobBackend),
}

impl BlobBackend for StorageBackend {
    fn name(&self) -> &str {
        match self {
            Self::Memory(b) => b.name(),
            Self::Fs(b) => b.name(),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Blob>, BlobError> {
        match self {
            Self::Memory(b) => b.get(name).await,
            Self::Fs(b) => b.get(name).await,
        }
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<Version, BlobError> {
        match self {
            Self::Memory(b) => b.put(name, data, condition).await,
            Self::Fs(b) => b.put(name, data, condition).await,
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, BlobError> {
        match self {
            Self::Memory(b) => b.delete(name).await,
            Self::Fs(b) => b.delete(name).await,
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        match self {
            Self::Memory(b) => b.list(prefix).await,
            Self::Fs(b) => b.list(prefix).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_condition_permits() {
        let v1 = Version::new("1");
        let v2 = Version::new("2");

        assert!(WriteCondition::Any.permits(None));
        assert!(WriteCondition::Any.permits(Some(&v1)));
        assert!(WriteCondition::IfMatch(v1.clone()).permits(Some(&v1)));
        assert!(!WriteCondition::IfMatch(v1.clone()).permits(Some(&v2)));
        assert!(!WriteCondition::IfMatch(v1.clone()).permits(None));
        assert!(WriteCondition::IfNotExists.permits(None));
        assert!(!WriteCondition::IfNotExists.permits(Some(&v1)));
    }

    #[test]
    fn test_condition_from_read() {
        let v = Version::new("abc");
        assert_eq!(
            WriteCondition::from_read(Some(&v)),
            WriteCondition::IfMatch(v)
        );
        assert_eq!(WriteCondition::from_read(None), WriteCondition::IfNotExists);
    }

    #[tokio::test]
    async fn test_storage_backend_dispatch() {
        let backend = StorageBackend::Memory(MemoryBlobBackend::new());
        assert_eq!(backend.name(), "memory");

        let v = backend
            .put("a.json", b"[]".to_vec(), WriteCondition::IfNotExists)
            .await
            .unwrap();
        let blob = backend.get("a.json").await.unwrap().unwrap();
        assert_eq!(blob.version, v);
        assert_eq!(backend.list("a").await.unwrap(), vec!["a.json".to_string()]);
        assert!(backend.delete("a.json").await.unwrap());
        assert!(backend.get("a.json").await.unwrap().is_none());
    }
}
