//! Chunked blob upload sessions.
//!
//! A session is a `blob_uploads` row plus a scratch file named after the
//! session id. Every successful append persists the new byte count and the
//! running hash state, so a session survives restarts and a failed append
//! leaves it at its last persisted offset.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hasher::HashState;
use super::{Digest, Registry, RegistryError, RegistryResult};
use crate::database::{BlobUpload, PackageStore, StoreError};

type BodyError = Box<dyn std::error::Error + Send + Sync>;

fn scratch_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(id)
}

fn body_error(err: impl Into<BodyError>) -> RegistryError {
    RegistryError::Io(io::Error::new(io::ErrorKind::Other, err.into()))
}

fn corrupt_state(err: serde_json::Error) -> RegistryError {
    RegistryError::Store(StoreError::Serialization(err))
}

/// An open upload session.
pub struct BlobUploader {
    upload: BlobUpload,
    hash: HashState,
    file: File,
    reading: bool,
}

impl BlobUploader {
    /// Allocate a session id, create its empty scratch file and row.
    pub async fn create(store: &dyn PackageStore, dir: &Path) -> RegistryResult<BlobUpload> {
        let id = Uuid::new_v4().simple().to_string();
        fs::create_dir_all(dir).await?;
        File::create(scratch_path(dir, &id)).await?;

        let state = HashState::new().to_json().map_err(corrupt_state)?;
        let mut tx = store.begin().await?;
        let upload = tx.create_blob_upload(&id, &state).await?;
        tx.commit().await?;

        debug!(upload_id = %id, "Created blob upload session");
        Ok(upload)
    }

    /// Open an existing session. Unknown ids yield
    /// [`RegistryError::BlobUploadUnknown`]. Opening truncates the scratch
    /// file to the persisted offset, so callers must hold the session's
    /// [`UploadLocks`] entry.
    ///
    /// Sessions are addressed by id alone and are not bound to the
    /// repository that created them.
    pub async fn open(store: &dyn PackageStore, dir: &Path, id: &str) -> RegistryResult<Self> {
        let mut tx = store.begin().await?;
        let upload = tx
            .get_blob_upload(id)
            .await?
            .ok_or(RegistryError::BlobUploadUnknown)?;
        drop(tx);

        let hash = HashState::from_json(&upload.hash_state).map_err(corrupt_state)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(scratch_path(dir, id))
            .await?;
        // Anything past the persisted offset is left over from an aborted append.
        file.set_len(upload.bytes_received as u64).await?;

        Ok(Self {
            upload,
            hash,
            file,
            reading: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.upload.id
    }

    /// Bytes received so far.
    pub fn size(&self) -> i64 {
        self.upload.bytes_received
    }

    pub fn digest(&self) -> Digest {
        self.hash.finish()
    }

    /// Append a body at `declared_offset`, which must equal [`Self::size`].
    pub async fn append<S, E>(
        &mut self,
        store: &dyn PackageStore,
        declared_offset: i64,
        mut body: S,
    ) -> RegistryResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: Into<BodyError>,
    {
        if self.reading {
            return Err(RegistryError::Io(io::Error::new(
                io::ErrorKind::Other,
                "upload session written to after it was read",
            )));
        }
        if declared_offset != self.upload.bytes_received {
            return Err(RegistryError::OffsetMismatch {
                expected: self.upload.bytes_received,
                actual: declared_offset,
            });
        }

        let start = self.upload.bytes_received;
        let mut hash = self.hash.clone();
        let mut written: i64 = 0;
        self.file.seek(SeekFrom::Start(start as u64)).await?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(body_error)?;
            self.file.write_all(&chunk).await?;
            hash.update(&chunk);
            written += chunk.len() as i64;
        }
        if written == 0 {
            return Ok(());
        }
        self.file.flush().await?;

        let state = hash.to_json().map_err(corrupt_state)?;
        let mut tx = store.begin().await?;
        match tx.update_blob_upload(&self.upload.id, start, start + written, &state).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Err(RegistryError::BlobUploadUnknown),
            Err(err) => return Err(err.into()),
        }
        tx.commit().await?;

        self.upload.bytes_received = start + written;
        self.hash = hash;
        Ok(())
    }

    /// Reader over the received bytes. No appends are accepted afterwards.
    pub async fn reader(&mut self) -> RegistryResult<Box<dyn AsyncRead + Send + Unpin>> {
        self.reading = true;
        let mut file = self.file.try_clone().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file.take(self.upload.bytes_received as u64)))
    }

    /// Delete a session row and its scratch file. Succeeds for unknown ids.
    pub async fn remove(store: &dyn PackageStore, dir: &Path, id: &str) -> RegistryResult<()> {
        let mut tx = store.begin().await?;
        tx.delete_blob_upload(id).await?;
        tx.commit().await?;
        remove_scratch_file(&scratch_path(dir, id)).await
    }
}

pub(crate) async fn remove_scratch_file(path: &Path) -> RegistryResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// A request body spooled to a scratch file while being hashed, for
/// uploads that arrive in a single request.
pub struct HashedBuffer {
    path: PathBuf,
    file: File,
    hash: HashState,
}

impl HashedBuffer {
    pub async fn from_stream<S, E>(dir: &Path, mut body: S) -> RegistryResult<Self>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: Into<BodyError>,
    {
        fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.buffer", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let mut buffer = Self {
            path,
            file,
            hash: HashState::new(),
        };
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(body_error)?;
            buffer.file.write_all(&chunk).await?;
            buffer.hash.update(&chunk);
        }
        buffer.file.flush().await?;
        Ok(buffer)
    }

    pub fn digest(&self) -> Digest {
        self.hash.finish()
    }

    pub fn size(&self) -> i64 {
        self.hash.len() as i64
    }

    pub async fn reader(&self) -> RegistryResult<Box<dyn AsyncRead + Send + Unpin>> {
        let mut file = self.file.try_clone().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file.take(self.hash.len())))
    }
}

impl Drop for HashedBuffer {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "Failed to remove upload buffer");
            }
        }
    }
}

/// Per-session locks so chunk requests for one upload id run one at a time.
#[derive(Default)]
pub struct UploadLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

impl Registry {
    /// Start a new chunked upload session.
    pub async fn create_upload(&self) -> RegistryResult<BlobUpload> {
        BlobUploader::create(self.store.as_ref(), &self.options.upload_dir).await
    }

    pub async fn open_upload(&self, id: &str) -> RegistryResult<BlobUploader> {
        BlobUploader::open(self.store.as_ref(), &self.options.upload_dir, id).await
    }

    /// Persisted byte count of a session. Reads the row only and never
    /// touches the scratch file, so it is safe while an append is running.
    pub async fn upload_size(&self, id: &str) -> RegistryResult<i64> {
        let mut tx = self.store.begin().await?;
        let upload = tx
            .get_blob_upload(id)
            .await?
            .ok_or(RegistryError::BlobUploadUnknown)?;
        Ok(upload.bytes_received)
    }

    pub async fn append_upload<S, E>(
        &self,
        uploader: &mut BlobUploader,
        declared_offset: i64,
        body: S,
    ) -> RegistryResult<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: Into<BodyError>,
    {
        uploader.append(self.store.as_ref(), declared_offset, body).await
    }

    /// Cancel a session. Unknown ids yield [`RegistryError::BlobUploadUnknown`].
    pub async fn cancel_upload(&self, id: &str) -> RegistryResult<()> {
        let mut tx = self.store.begin().await?;
        if tx.get_blob_upload(id).await?.is_none() {
            return Err(RegistryError::BlobUploadUnknown);
        }
        drop(tx);
        BlobUploader::remove(self.store.as_ref(), &self.options.upload_dir, id).await
    }

    pub async fn spool_body<S, E>(&self, body: S) -> RegistryResult<HashedBuffer>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: Into<BodyError>,
    {
        HashedBuffer::from_stream(&self.options.upload_dir, body).await
    }
}
