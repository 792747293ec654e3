//! Whole-file JSON persistence for the registries.
//!
//! Every mutation rewrites the full table. The new contents go to a sibling
//! `.tmp` file which is then renamed over the target, so a crash mid-write
//! leaves the previous snapshot readable.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SnapshotError;

/// A JSON document on disk holding one registry table.
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    path: PathBuf,
}

impl JsonSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. A missing file is `Ok(None)`.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SnapshotError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Load the snapshot, starting empty when the file is missing or unreadable JSON.
    pub async fn load_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, SnapshotError> {
        match self.load().await {
            Ok(value) => Ok(value.unwrap_or_default()),
            Err(SnapshotError::Parse { path, source }) => {
                tracing::warn!(
                    path = %path.display(),
                    "Discarding malformed snapshot: {}",
                    source
                );
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save<T: Serialize>(&self, value: &T) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(value)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.write_error(source))?;
        }

        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| self.write_error(source))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| self.write_error(source))?;

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// Exclusive advisory lock on the state directory.
///
/// Two orchestrators sharing one data directory would overwrite each other's
/// snapshots. The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct StateDirLock {
    file: File,
    path: PathBuf,
}

impl StateDirLock {
    pub const FILE_NAME: &'static str = "orchestrator.lock";

    pub fn acquire(state_dir: &Path) -> Result<Self, SnapshotError> {
        let path = state_dir.join(Self::FILE_NAME);
        std::fs::create_dir_all(state_dir).map_err(|source| SnapshotError::Write {
            path: state_dir.to_path_buf(),
            source,
        })?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| SnapshotError::Write {
                path: path.clone(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| SnapshotError::Locked {
                path: state_dir.to_path_buf(),
            })?;

        tracing::debug!(path = %path.display(), "Acquired state directory lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateDirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
