use tokio::io::AsyncRead;
use tracing::{info, instrument};

use super::resolver::find_many_in;
use super::uploader::{BlobUploader, HashedBuffer};
use super::{
    Digest, QuotaLimits, Registry, RegistryError, RegistryResult, Repository, PROPERTY_DIGEST,
    PROPERTY_REPOSITORY, UPLOAD_VERSION,
};
use crate::database::{
    self, FileSearchOptions, NewPackage, NewPackageBlob, NewPackageFile, NewPackageVersion, Package,
    PackageBlob, PackageTx, PackageVersion, PropertyType, StoreError,
};

/// Canonical file name of a layer or config blob.
pub fn blob_file_name(hash_sha256: &str) -> String {
    format!("sha256_{}", hash_sha256).to_lowercase()
}

/// Fetch or create the package for `repo`, adding the canonical repository
/// property when the package is new.
pub(crate) async fn get_or_create_package(tx: &mut dyn PackageTx, repo: &Repository) -> RegistryResult<Package> {
    let (package, created) = tx
        .get_or_insert_package(&NewPackage {
            owner: repo.owner.clone(),
            name: repo.image.as_str().to_string(),
        })
        .await?;
    if created {
        tx.insert_property(PropertyType::Package, package.id, PROPERTY_REPOSITORY, &repo.full_name())
            .await?;
    }
    Ok(package)
}

/// Fetch or create the internal version that parks uploaded blobs.
pub(crate) async fn get_or_create_upload_version(
    tx: &mut dyn PackageTx,
    repo: &Repository,
    creator: &str,
) -> RegistryResult<PackageVersion> {
    let package = get_or_create_package(tx, repo).await?;
    let (version, _) = tx
        .get_or_insert_version(&NewPackageVersion {
            package_id: package.id,
            creator: creator.to_string(),
            version: UPLOAD_VERSION.to_string(),
            is_internal: true,
            metadata_json: "null".to_string(),
            download_count: 0,
        })
        .await?;
    Ok(version)
}

pub(crate) async fn check_size_quota(tx: &mut dyn PackageTx, limits: &QuotaLimits, owner: &str, size: i64) -> RegistryResult<()> {
    if limits.size_container > -1 && size > limits.size_container {
        return Err(RegistryError::QuotaExceeded(format!(
            "blob of {size} bytes exceeds the per-file limit of {} bytes",
            limits.size_container
        )));
    }
    if limits.total_owner_size > -1 {
        let total = tx.sum_owner_file_size(owner).await?;
        if total + size > limits.total_owner_size {
            return Err(RegistryError::QuotaExceeded(format!(
                "owner {owner} would exceed the total size limit of {} bytes",
                limits.total_owner_size
            )));
        }
    }
    Ok(())
}

pub(crate) async fn check_count_quota(tx: &mut dyn PackageTx, limits: &QuotaLimits, owner: &str) -> RegistryResult<()> {
    if limits.total_owner_count > -1 {
        let count = tx.count_owner_versions(owner).await?;
        if count > limits.total_owner_count {
            return Err(RegistryError::QuotaExceeded(format!(
                "owner {owner} would exceed the limit of {} package versions",
                limits.total_owner_count
            )));
        }
    }
    Ok(())
}

/// Attach `blob` to `version` under its canonical file name with a digest
/// property. Attaching the same blob twice is a no-op.
async fn attach_to_version(tx: &mut dyn PackageTx, version: &PackageVersion, blob: &PackageBlob) -> RegistryResult<()> {
    let file = match tx
        .insert_file(&NewPackageFile {
            version_id: version.id,
            blob_id: blob.id,
            name: blob_file_name(&blob.hash_sha256),
            is_lead: false,
        })
        .await
    {
        Ok(file) => file,
        Err(StoreError::Duplicate) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    tx.insert_property(PropertyType::File, file.id, PROPERTY_DIGEST, &format!("sha256:{}", blob.hash_sha256))
        .await?;
    Ok(())
}

impl Registry {
    /// Register uploaded content as a blob parked in the upload version of
    /// `repo`. Bytes reach the content store only when the hash is new; if
    /// anything fails afterwards, those bytes are removed again.
    #[instrument(skip(self, content), fields(repository = %repo, digest = %digest))]
    pub async fn save_as_package_blob(
        &self,
        repo: &Repository,
        creator: &str,
        digest: &Digest,
        size: i64,
        content: Box<dyn AsyncRead + Send + Unpin>,
    ) -> RegistryResult<PackageBlob> {
        let mut tx = self.store.begin().await?;
        let upload_version = get_or_create_upload_version(tx.as_mut(), repo, creator).await?;
        check_size_quota(tx.as_mut(), &self.options.limits, &repo.owner, size).await?;

        let (blob, exists) = tx
            .get_or_insert_blob(&NewPackageBlob {
                size,
                hash_sha256: digest.hex().to_string(),
            })
            .await?;

        // A known hash whose bytes went missing is written again
        let write = !exists || !self.storage.blob_exists(&blob.hash_sha256).await?;

        let outcome: RegistryResult<()> = async {
            if write {
                self.storage
                    .put_blob_streaming(&blob.hash_sha256, size as u64, content)
                    .await?;
                metrics::counter!("registry_blob_bytes_written_total").increment(size as u64);
            }
            attach_to_version(tx.as_mut(), &upload_version, &blob).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            if !exists {
                self.discard_content(&blob.hash_sha256).await;
            }
            return Err(err);
        }

        metrics::counter!("registry_blob_uploads_total").increment(1);
        info!(size, deduplicated = exists, "Stored blob");
        Ok(blob)
    }

    /// Finalize a chunked upload: verify the digest, register the blob and
    /// close the session.
    pub async fn finish_upload(
        &self,
        repo: &Repository,
        creator: &str,
        mut uploader: BlobUploader,
        digest: &Digest,
    ) -> RegistryResult<PackageBlob> {
        let actual = uploader.digest();
        if &actual != digest {
            return Err(RegistryError::DigestInvalid(format!("expected {digest}, computed {actual}")));
        }
        let content = uploader.reader().await?;
        let blob = self
            .save_as_package_blob(repo, creator, digest, uploader.size(), content)
            .await?;
        let id = uploader.id().to_string();
        drop(uploader);
        BlobUploader::remove(self.store.as_ref(), &self.options.upload_dir, &id).await?;
        Ok(blob)
    }

    /// Register a body uploaded in a single request.
    pub async fn finish_monolithic_upload(
        &self,
        repo: &Repository,
        creator: &str,
        buffer: HashedBuffer,
        digest: &Digest,
    ) -> RegistryResult<PackageBlob> {
        let actual = buffer.digest();
        if &actual != digest {
            return Err(RegistryError::DigestInvalid(format!("expected {digest}, computed {actual}")));
        }
        let content = buffer.reader().await?;
        self.save_as_package_blob(repo, creator, digest, buffer.size(), content)
            .await
    }

    /// Make a blob from the repository named `from` available to `repo`
    /// without transferring it. Returns false when the source does not have
    /// the blob.
    #[instrument(skip(self), fields(repository = %repo, digest = %digest))]
    pub async fn mount_blob(&self, repo: &Repository, creator: &str, from: &str, digest: &Digest) -> RegistryResult<bool> {
        let opts = FileSearchOptions::for_repository_name(from).with_digest(digest);
        let Some(source) = self.find_stored(&opts).await? else {
            return Ok(false);
        };

        let mut tx = self.store.begin().await?;
        let upload_version = get_or_create_upload_version(tx.as_mut(), repo, creator).await?;
        attach_to_version(tx.as_mut(), &upload_version, &source.blob).await?;
        tx.commit().await?;

        info!(from, "Mounted blob");
        Ok(true)
    }

    /// Remove every file carrying `digest` under `repo`. Fails with
    /// [`RegistryError::BlobUnknown`] when there is none.
    #[instrument(skip(self), fields(repository = %repo, digest = %digest))]
    pub async fn delete_blob(&self, repo: &Repository, digest: &Digest) -> RegistryResult<()> {
        let mut tx = self.store.begin().await?;
        let opts = FileSearchOptions::for_repository(repo).with_digest(digest);
        let descriptors = find_many_in(tx.as_mut(), &opts).await?;
        if descriptors.is_empty() {
            return Err(RegistryError::BlobUnknown);
        }
        for descriptor in &descriptors {
            database::delete_file(tx.as_mut(), &descriptor.file).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_file_name_is_lowercase() {
        assert_eq!(blob_file_name("ABCDEF"), "sha256_abcdef");
    }
}
