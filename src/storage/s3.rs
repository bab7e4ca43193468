use super::{validate_key, Storage};
use anyhow::Result;
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use bytes::Bytes;
use secrecy::{ExposeSecret, Secret};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Parts are at least this large; S3 rejects non-final parts under 5 MiB.
const MIN_PART_SIZE: u64 = 8 * 1024 * 1024;
/// S3 caps a multipart upload at this many parts.
const MAX_PARTS: u64 = 10_000;

/// Part size for an object of `content_length` bytes.
fn part_size(content_length: u64) -> u64 {
    MIN_PART_SIZE.max(content_length.div_ceil(MAX_PARTS))
}

pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub use_path_style: bool,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Self {
        let creds = Credentials::new(
            &config.access_key_id,
            config.secret_access_key.expose_secret(),
            None,
            None,
            "container-registry",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(&config.endpoint)
            .credentials_provider(creds)
            .force_path_style(config.use_path_style)
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    fn object_key(hash: &str) -> Result<String> {
        validate_key(hash)?;
        Ok(format!("blobs/sha256/{}/{}", &hash[0..2], hash))
    }

    /// Upload every part of `data` under an open multipart upload.
    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        content_length: u64,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Vec<CompletedPart>> {
        let part_size = part_size(content_length);
        let mut parts = Vec::new();
        let mut total: u64 = 0;
        loop {
            let remaining = content_length.saturating_sub(total);
            let mut part = Vec::with_capacity(part_size.min(remaining) as usize);
            (&mut *data).take(part_size).read_to_end(&mut part).await?;
            if part.is_empty() {
                break;
            }
            total += part.len() as u64;
            let part_number = parts.len() as i32 + 1;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await?;
            parts.push(
                CompletedPart::builder()
                    .e_tag(output.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
        }
        if total != content_length {
            anyhow::bail!("short write for {key}: expected {content_length} bytes, got {total}");
        }
        Ok(parts)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put_blob(&self, hash: &str, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(Self::object_key(hash)?)
            .body(ByteStream::from(data))
            .send()
            .await?;
        Ok(())
    }

    async fn put_blob_streaming(
        &self,
        hash: &str,
        content_length: u64,
        mut data: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<()> {
        // Small blobs fit in one PutObject, which needs a sized body
        if content_length <= MIN_PART_SIZE {
            let mut buffer = Vec::with_capacity(content_length as usize);
            data.read_to_end(&mut buffer).await?;
            if buffer.len() as u64 != content_length {
                anyhow::bail!(
                    "short write for {hash}: expected {content_length} bytes, got {}",
                    buffer.len()
                );
            }
            return self.put_blob(hash, Bytes::from(buffer)).await;
        }

        let key = Self::object_key(hash)?;
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow::anyhow!("S3 returned no upload id for {key}"))?
            .to_string();

        let parts = match self.upload_parts(&key, &upload_id, content_length, data.as_mut()).await {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key = %key, error = %abort_err, "Failed to abort multipart upload");
                }
                return Err(err);
            }
        };

        debug!(key = %key, parts = parts.len(), "Completing multipart upload");
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await?;
        Ok(())
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Bytes>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::object_key(hash)?)
            .send()
            .await
        {
            Ok(response) => Ok(Some(response.body.collect().await?.into_bytes())),
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_blob_streaming(
        &self,
        hash: &str,
    ) -> Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(Self::object_key(hash)?)
            .send()
            .await
        {
            Ok(response) => Ok(Some(Box::new(response.body.into_async_read()))),
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_blob(&self, hash: &str) -> Result<bool> {
        if !self.blob_exists(hash).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(Self::object_key(hash)?)
            .send()
            .await?;
        Ok(true)
    }

    async fn blob_exists(&self, hash: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(Self::object_key(hash)?)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(err)) if err.err().is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        // Listing one key verifies connectivity and permissions
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await?;
        Ok(())
    }
}
