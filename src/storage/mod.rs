//! Object-store capability for archived call audio.
//!
//! The store itself is an external collaborator; deployments point the
//! filesystem implementation at a mounted bucket or swap in a vendor
//! adapter behind the same trait.

use crate::config::ObjectStoreConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::info;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`. Returns the stored object's URI.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> AppResult<String>;

    /// Upload raw bytes under `key`.
    async fn put_bytes(&self, key: &str, data: Bytes, content_type: &str) -> AppResult<String>;
}

/// Filesystem-backed object store rooted at `{root}/{bucket}`.
pub struct FsObjectStore {
    base: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(cfg: &ObjectStoreConfig) -> Self {
        Self {
            base: PathBuf::from(&cfg.root).join(&cfg.bucket),
            bucket: cfg.bucket.clone(),
        }
    }

    pub fn with_base(base: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        let bucket = bucket.into();
        Self {
            base: base.into().join(&bucket),
            bucket,
        }
    }

    fn object_path(&self, key: &str) -> AppResult<PathBuf> {
        // Keys are server-generated, but reject traversal anyway.
        if key.split('/').any(|part| part == "..") {
            return Err(AppError::Storage(format!("invalid object key: {key}")));
        }
        Ok(self.base.join(key))
    }

    fn uri(&self, key: &str) -> String {
        format!("store://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> AppResult<String> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes_copied = tokio::fs::copy(path, &dest).await?;
        info!(key, content_type, bytes = bytes_copied, "Uploaded object");
        Ok(self.uri(key))
    }

    async fn put_bytes(&self, key: &str, data: Bytes, content_type: &str) -> AppResult<String> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, &data).await?;
        info!(key, content_type, bytes = data.len(), "Uploaded object");
        Ok(self.uri(key))
    }
}
