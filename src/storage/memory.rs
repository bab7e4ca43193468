use super::{validate_key, Storage};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Process-local storage for tests and throwaway instances.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of put calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Bytes>> {
        self.blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Bytes>> {
        self.blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_blob(&self, hash: &str, data: Bytes) -> Result<()> {
        validate_key(hash)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.write().insert(hash.to_string(), data);
        Ok(())
    }

    async fn put_blob_streaming(
        &self,
        hash: &str,
        content_length: u64,
        mut data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        validate_key(hash)?;
        let mut buffer = Vec::with_capacity(content_length as usize);
        data.read_to_end(&mut buffer).await?;
        if buffer.len() as u64 != content_length {
            anyhow::bail!("short write for {hash}: expected {content_length} bytes, got {}", buffer.len());
        }
        self.put_blob(hash, Bytes::from(buffer)).await
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Bytes>> {
        validate_key(hash)?;
        Ok(self.read().get(hash).cloned())
    }

    async fn get_blob_streaming(&self, hash: &str) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        validate_key(hash)?;
        Ok(self
            .read()
            .get(hash)
            .cloned()
            .map(|data| Box::new(Cursor::new(data)) as Box<dyn AsyncRead + Send + Unpin>))
    }

    async fn delete_blob(&self, hash: &str) -> Result<bool> {
        validate_key(hash)?;
        Ok(self.write().remove(hash).is_some())
    }

    async fn blob_exists(&self, hash: &str) -> Result<bool> {
        validate_key(hash)?;
        Ok(self.read().contains_key(hash))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
