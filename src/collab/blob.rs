//! Filesystem-backed blob store.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::collab::BlobStore;
use crate::error::CollaboratorError;

/// Copies artifacts under a root directory and hands out URLs below a base URL.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Serve blobs as `file://` URLs of the root directory.
    pub fn file_urls(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base_url = format!("file://{}", root.display());
        Self::new(root, base_url)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn upload(&self, local_path: &Path, object_path: &str) -> Result<String, CollaboratorError> {
        let relative = Path::new(object_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CollaboratorError::Unavailable {
                service: "blob store",
                reason: format!("invalid object path: {}", object_path),
            });
        }

        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;

        Ok(format!("{}/{}", self.base_url, object_path))
    }
}
