use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{Blob, BlobBackend, BlobError, Version, WriteCondition};

/// Blob backend storing one file per blob under a root directory.
///
/// Blob names may contain `/` separators, which map to subdirectories.
/// The version of a blob is the hex SHA-256 of its content. Writes go
/// through a temp file and rename, serialized by a backend-wide lock so
/// the precondition check and the write are atomic within this process.
/// Temp files carry the process id and a per-backend sequence, so writers
/// sharing a directory never clobber each other's partial writes.
pub struct FsBlobBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl FsBlobBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(BlobError::InvalidName {
                name: name.to_string(),
            });
        }

        Ok(self.root.join(relative))
    }

    /// Unique sibling path for staging a write to `path`.
    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".{}-{seq}.tmp", std::process::id()));
        PathBuf::from(tmp)
    }

    async fn read_current(&self, name: &str, path: &Path) -> Result<Option<Blob>, BlobError> {
        match tokio::fs::read(path).await {
            Ok(data) => {
                let version = content_version(&data);
                Ok(Some(Blob { data, version }))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(BlobError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

fn content_version(data: &[u8]) -> Version {
    Version::new(format!("{:x}", Sha256::digest(data)))
}

fn io_err(name: &str) -> impl FnOnce(std::io::Error) -> BlobError + '_ {
    move |source| BlobError::Io {
        name: name.to_string(),
        source,
    }
}

impl BlobBackend for FsBlobBackend {
    fn name(&self) -> &str {
        "fs"
    }

    async fn get(&self, name: &str) -> Result<Option<Blob>, BlobError> {
        let path = self.path_for(name)?;
        self.read_current(name, &path).await
    }

    async fn put(
        &self,
        name: &str,
        data: Vec<u8>,
        condition: WriteCondition,
    ) -> Result<Version, BlobError> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_current(name, &path).await?;
        if !condition.permits(current.as_ref().map(|b| &b.version)) {
            return Err(BlobError::Conflict {
                name: name.to_string(),
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(name))?;
        }

        let version = content_version(&data);
        let tmp = self.temp_path(&path);

        let staged = match tokio::fs::write(&tmp, &data).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(name)(e));
        }

        Ok(version)
    }

    async fn delete(&self, name: &str) -> Result<bool, BlobError> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BlobError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(BlobError::Io {
                        name: dir.display().to_string(),
                        source,
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(io_err(prefix))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(io_err(prefix))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if name.ends_with(".tmp") {
                    continue;
                }
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }
}
