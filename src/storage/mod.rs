//! Content-addressed byte storage.
//!
//! Keys are lowercase hex SHA-256 hashes. The metadata store decides which
//! keys are live; the backends only move bytes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::info;

use crate::config::settings::{StorageBackend, StorageSettings};

pub mod filesystem;
pub mod memory;
pub mod s3;

pub use filesystem::FilesystemStorage;
pub use memory::MemoryStorage;
pub use s3::{S3Config, S3Storage};

/// Storage backend trait that must be implemented by all storage providers
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Store a blob under its hash
    async fn put_blob(&self, hash: &str, data: Bytes) -> Result<()>;

    /// Store a blob from a reader of exactly `content_length` bytes
    async fn put_blob_streaming(
        &self,
        hash: &str,
        content_length: u64,
        data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()>;

    async fn get_blob(&self, hash: &str) -> Result<Option<Bytes>>;

    async fn get_blob_streaming(&self, hash: &str) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>>;

    /// Delete a blob. Returns false when there was nothing to delete.
    async fn delete_blob(&self, hash: &str) -> Result<bool>;

    async fn blob_exists(&self, hash: &str) -> Result<bool>;

    /// Perform a health check on the storage backend
    async fn health_check(&self) -> Result<()>;
}

/// Build the configured content store.
pub fn from_settings(settings: &StorageSettings) -> Result<Arc<dyn Storage>> {
    match settings.backend {
        StorageBackend::Filesystem => {
            info!(path = %settings.path.display(), "Using filesystem content store");
            Ok(Arc::new(FilesystemStorage::new(settings.path.clone())))
        }
        StorageBackend::S3 => {
            let s3 = settings.s3.as_ref().context("S3 storage selected without S3 settings")?;
            info!(endpoint = %s3.endpoint, bucket = %s3.bucket, "Using S3 content store");
            Ok(Arc::new(S3Storage::new(&s3.to_config())))
        }
        StorageBackend::Memory => {
            info!("Using in-memory content store; data is lost on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

/// Reject anything that is not a lowercase hex SHA-256 before it turns
/// into a path or object key.
pub(crate) fn validate_key(hash: &str) -> Result<()> {
    if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        bail!("invalid content key: {hash:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        let hash = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert!(validate_key(hash).is_ok());
        assert!(validate_key(&hash.to_uppercase()).is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("").is_err());
    }
}
