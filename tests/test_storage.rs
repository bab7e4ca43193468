mod utils;

use anyhow::Result;
use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

use container_registry::storage::{FilesystemStorage, MemoryStorage, Storage};

fn hash_of(content: &[u8]) -> String {
    utils::digest_of(content).trim_start_matches("sha256:").to_string()
}

/// Backends under test; the temp dir must outlive the filesystem backend.
fn backends() -> (TempDir, Vec<(&'static str, Arc<dyn Storage>)>) {
    let dir = TempDir::new().expect("temp dir");
    let backends: Vec<(&'static str, Arc<dyn Storage>)> = vec![
        ("memory", Arc::new(MemoryStorage::new())),
        ("filesystem", Arc::new(FilesystemStorage::new(dir.path().to_path_buf()))),
    ];
    (dir, backends)
}

#[tokio::test]
async fn test_basic_blob_operations() -> Result<()> {
    let (_dir, backends) = backends();
    let content = Bytes::from("Hello, World!");
    let hash = hash_of(&content);

    for (name, storage) in backends {
        storage.put_blob(&hash, content.clone()).await?;
        assert!(storage.blob_exists(&hash).await?, "{name}");
        assert_eq!(storage.get_blob(&hash).await?, Some(content.clone()), "{name}");

        assert!(storage.delete_blob(&hash).await?, "{name}");
        assert!(!storage.blob_exists(&hash).await?, "{name}");
        assert!(!storage.delete_blob(&hash).await?, "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_streaming_operations() -> Result<()> {
    let (_dir, backends) = backends();
    let content = Bytes::from("Hello from stream!");
    let hash = hash_of(&content);

    for (name, storage) in backends {
        let reader = Box::new(std::io::Cursor::new(content.clone()));
        storage
            .put_blob_streaming(&hash, content.len() as u64, reader)
            .await?;

        let mut reader = storage
            .get_blob_streaming(&hash)
            .await?
            .unwrap_or_else(|| panic!("{name}: streaming blob not found"));
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        assert_eq!(buf, content, "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_short_stream_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = FilesystemStorage::new(dir.path().to_path_buf());
    let content = Bytes::from("short");
    let hash = hash_of(&content);

    let reader = Box::new(std::io::Cursor::new(content.clone()));
    assert!(storage.put_blob_streaming(&hash, 100, reader).await.is_err());
    assert!(!storage.blob_exists(&hash).await?);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_access() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = Arc::new(FilesystemStorage::new(dir.path().to_path_buf()));

    let writes = (0..10u8)
        .map(|i| {
            let storage = storage.clone();
            tokio::spawn(async move {
                let content = Bytes::from(vec![i]);
                storage.put_blob(&hash_of(&content), content).await
            })
        })
        .collect::<Vec<_>>();
    for result in join_all(writes).await {
        result??;
    }

    for i in 0..10u8 {
        let content = Bytes::from(vec![i]);
        assert_eq!(storage.get_blob(&hash_of(&content)).await?, Some(content));
    }
    Ok(())
}

#[tokio::test]
async fn test_error_conditions() -> Result<()> {
    let (_dir, backends) = backends();
    let missing = hash_of(b"never stored");

    for (name, storage) in backends {
        assert!(storage.get_blob(&missing).await?.is_none(), "{name}");
        assert!(storage.get_blob_streaming(&missing).await?.is_none(), "{name}");
        assert!(!storage.delete_blob(&missing).await?, "{name}");
        // Keys must be bare sha256 hex
        assert!(storage.put_blob("../escape", Bytes::from("x")).await.is_err(), "{name}");
        assert!(storage.blob_exists("sha256:abc").await.is_err(), "{name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let (_dir, backends) = backends();
    for (_, storage) in backends {
        storage.health_check().await?;
    }
    Ok(())
}
