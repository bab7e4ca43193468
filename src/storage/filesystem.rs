use super::{validate_key, Storage};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

/// Blobs laid out as `<root>/ab/cd/<hash>`.
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        validate_key(hash)?;
        // Fan out over two directory levels to keep directories small
        Ok(self.root_path.join(&hash[0..2]).join(&hash[2..4]).join(hash))
    }

    fn temp_path(&self) -> PathBuf {
        self.root_path.join(format!(".tmp-{}", Uuid::new_v4().simple()))
    }

    async fn ensure_parent(path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn put_blob(&self, hash: &str, data: Bytes) -> Result<()> {
        let path = self.blob_path(hash)?;
        Self::ensure_parent(&path).await?;

        let temp = self.temp_path();
        fs::write(&temp, &data).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn put_blob_streaming(
        &self,
        hash: &str,
        content_length: u64,
        mut data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        let path = self.blob_path(hash)?;
        Self::ensure_parent(&path).await?;

        // Readers only ever see complete blobs
        let temp = self.temp_path();
        let written = {
            let mut file = fs::File::create(&temp).await?;
            let written = tokio::io::copy(&mut data, &mut file).await;
            file.flush().await?;
            written
        };
        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                return Err(err.into());
            }
        };
        if written != content_length {
            let _ = fs::remove_file(&temp).await;
            bail!("short write for {hash}: expected {content_length} bytes, got {written}");
        }
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Bytes>> {
        let path = self.blob_path(hash)?;
        match fs::read(path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_blob_streaming(&self, hash: &str) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        let path = self.blob_path(hash)?;
        match fs::File::open(path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_blob(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn blob_exists(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        Ok(fs::try_exists(path).await?)
    }

    async fn health_check(&self) -> Result<()> {
        fs::create_dir_all(&self.root_path).await?;

        // Write and remove a marker file
        let test_path = self.root_path.join(".health_check");
        fs::write(&test_path, b"health check").await?;
        fs::remove_file(test_path).await?;

        Ok(())
    }
}
