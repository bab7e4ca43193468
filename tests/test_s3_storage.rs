//! Runs against a live S3-compatible endpoint (MinIO works):
//! `S3_TEST_ENDPOINT=http://localhost:9000 cargo test --test test_s3_storage -- --ignored`

mod utils;

use bytes::Bytes;
use secrecy::Secret;
use tokio::io::AsyncReadExt;

use container_registry::storage::{S3Config, S3Storage, Storage};

fn setup_test_config() -> S3Config {
    let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    S3Config {
        endpoint: var("S3_TEST_ENDPOINT", "http://localhost:9000"),
        region: var("S3_TEST_REGION", "us-east-1"),
        bucket: var("S3_TEST_BUCKET", "container-registry-test"),
        access_key_id: var("S3_TEST_ACCESS_KEY_ID", "minioadmin"),
        secret_access_key: Secret::new(var("S3_TEST_SECRET_ACCESS_KEY", "minioadmin")),
        use_path_style: true,
    }
}

fn hash_of(content: &[u8]) -> String {
    utils::digest_of(content).trim_start_matches("sha256:").to_string()
}

#[tokio::test]
#[ignore = "needs an S3 endpoint"]
async fn test_s3_basic_operations() {
    let storage = S3Storage::new(&setup_test_config());
    let content = Bytes::from("Hello, this is a test file!");
    let hash = hash_of(&content);

    storage.put_blob(&hash, content.clone()).await.expect("Failed to put blob");
    assert!(storage.blob_exists(&hash).await.expect("Failed to check blob existence"));
    assert_eq!(
        storage.get_blob(&hash).await.expect("Failed to get blob"),
        Some(content)
    );

    assert!(storage.delete_blob(&hash).await.expect("Failed to delete blob"));
    assert!(!storage.blob_exists(&hash).await.expect("Failed to check blob existence after deletion"));
    assert!(storage.get_blob(&hash).await.expect("Failed to get blob").is_none());
}

#[tokio::test]
#[ignore = "needs an S3 endpoint"]
async fn test_s3_streaming_upload() {
    let storage = S3Storage::new(&setup_test_config());
    let large_data = vec![7u8; 6 * 1024 * 1024];
    let hash = hash_of(&large_data);

    let reader = std::io::Cursor::new(large_data.clone());
    storage
        .put_blob_streaming(&hash, large_data.len() as u64, Box::new(reader))
        .await
        .expect("Failed to upload large blob");

    let mut reader = storage
        .get_blob_streaming(&hash)
        .await
        .expect("Failed to open blob")
        .expect("Blob not found");
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("Failed to read blob");
    assert_eq!(buf.len(), large_data.len());

    storage.delete_blob(&hash).await.expect("Failed to delete blob");
}

#[tokio::test]
#[ignore = "needs an S3 endpoint"]
async fn test_s3_health_check() {
    let storage = S3Storage::new(&setup_test_config());
    storage.health_check().await.expect("bucket is reachable");
}
