//! Lookup of blobs and manifests under an owner/image.
//!
//! When several files match one query (the same manifest digest pushed under
//! two tags, say) the first row in file id order wins. That order is stable
//! for a given store but carries no further meaning.

use std::collections::BTreeSet;
use tokio::io::AsyncRead;
use tracing::debug;

use super::{Digest, Registry, RegistryError, RegistryResult, Repository, PROPERTY_DIGEST, PROPERTY_MEDIA_TYPE};
use crate::database::{
    FileSearchOptions, PackageBlob, PackageFile, PackageProperty, PackageTx, PackageVersion, PropertyType,
};

/// A file together with the version it belongs to, its blob and its properties.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub version: PackageVersion,
    pub file: PackageFile,
    pub blob: PackageBlob,
    pub properties: Vec<PackageProperty>,
}

impl BlobDescriptor {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn digest(&self) -> String {
        self.property(PROPERTY_DIGEST)
            .map(str::to_string)
            .unwrap_or_else(|| format!("sha256:{}", self.blob.hash_sha256))
    }

    pub fn media_type(&self) -> Option<&str> {
        self.property(PROPERTY_MEDIA_TYPE)
    }
}

impl FileSearchOptions {
    /// Everything stored under one owner/image.
    pub fn for_repository(repo: &Repository) -> Self {
        Self {
            owner: Some(repo.owner.clone()),
            image: Some(repo.image.as_str().to_string()),
            ..Default::default()
        }
    }

    /// Everything stored under the package carrying this canonical name.
    pub fn for_repository_name(full_name: &str) -> Self {
        Self {
            repository: Some(full_name.to_lowercase()),
            ..Default::default()
        }
    }

    pub fn with_digest(mut self, digest: &Digest) -> Self {
        self.digest = Some(digest.as_str().to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_lowercase());
        self
    }

    pub fn manifests_only(mut self) -> Self {
        self.is_manifest = true;
        self
    }
}

async fn describe(tx: &mut dyn PackageTx, file: PackageFile) -> RegistryResult<Option<BlobDescriptor>> {
    let Some(version) = tx.get_version_by_id(file.version_id).await? else {
        return Ok(None);
    };
    let Some(blob) = tx.get_blob_by_id(file.blob_id).await? else {
        return Ok(None);
    };
    let properties = tx.get_properties(PropertyType::File, file.id).await?;
    Ok(Some(BlobDescriptor { version, file, blob, properties }))
}

/// All matching files, in file id order.
pub(crate) async fn find_many_in(
    tx: &mut dyn PackageTx,
    opts: &FileSearchOptions,
) -> RegistryResult<Vec<BlobDescriptor>> {
    let files = tx.search_files(opts, None).await?;
    let mut descriptors = Vec::with_capacity(files.len());
    for file in files {
        if let Some(descriptor) = describe(tx, file).await? {
            descriptors.push(descriptor);
        }
    }
    Ok(descriptors)
}

/// The first matching file, if any.
pub(crate) async fn find_one_in(
    tx: &mut dyn PackageTx,
    opts: &FileSearchOptions,
) -> RegistryResult<Option<BlobDescriptor>> {
    match tx.search_files(opts, Some(1)).await?.into_iter().next() {
        Some(file) => describe(tx, file).await,
        None => Ok(None),
    }
}

/// Distinct versions owning the matching files, in first-match order.
pub(crate) async fn find_versions_in(
    tx: &mut dyn PackageTx,
    opts: &FileSearchOptions,
) -> RegistryResult<Vec<PackageVersion>> {
    let mut seen = BTreeSet::new();
    let mut versions = Vec::new();
    for file in tx.search_files(opts, None).await? {
        if seen.insert(file.version_id) {
            if let Some(version) = tx.get_version_by_id(file.version_id).await? {
                versions.push(version);
            }
        }
    }
    Ok(versions)
}

impl Registry {
    pub async fn find_one(&self, opts: &FileSearchOptions) -> RegistryResult<Option<BlobDescriptor>> {
        let mut tx = self.store.begin().await?;
        find_one_in(tx.as_mut(), opts).await
    }

    pub async fn find_many(&self, opts: &FileSearchOptions) -> RegistryResult<Vec<BlobDescriptor>> {
        let mut tx = self.store.begin().await?;
        find_many_in(tx.as_mut(), opts).await
    }

    /// Like [`Registry::find_one`], but a match whose bytes are missing from
    /// the content store counts as no match.
    pub async fn find_stored(&self, opts: &FileSearchOptions) -> RegistryResult<Option<BlobDescriptor>> {
        let Some(descriptor) = self.find_one(opts).await? else {
            return Ok(None);
        };
        if !self.storage.blob_exists(&descriptor.blob.hash_sha256).await? {
            debug!(
                hash = %descriptor.blob.hash_sha256,
                "Package registry inconsistent: blob missing from content store"
            );
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    /// Open the content of a resolved blob. Missing bytes surface as
    /// [`RegistryError::BlobUnknown`].
    pub async fn open_blob(&self, descriptor: &BlobDescriptor) -> RegistryResult<Box<dyn AsyncRead + Send + Unpin>> {
        self.storage
            .get_blob_streaming(&descriptor.blob.hash_sha256)
            .await?
            .ok_or(RegistryError::BlobUnknown)
    }

    /// Non-internal versions of the image that were pushed by tag.
    pub async fn find_tagged_versions(&self, repo: &Repository) -> RegistryResult<Vec<PackageVersion>> {
        let mut tx = self.store.begin().await?;
        let Some(package) = tx.get_package_by_name(&repo.owner, repo.image.as_str()).await? else {
            return Ok(Vec::new());
        };
        let mut versions = Vec::new();
        for tag in tx.search_image_tags(package.id, "", None).await? {
            if let Some(version) = tx.get_version_by_name(package.id, &tag.to_lowercase()).await? {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// Tags of an image in ascending lowercase order, strictly after `last`.
    /// `limit` of `None` means no limit; `Some(0)` yields an empty page.
    pub async fn list_tags(&self, repo: &Repository, last: &str, limit: Option<i64>) -> RegistryResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        let package = tx
            .get_package_by_name(&repo.owner, repo.image.as_str())
            .await?
            .ok_or(RegistryError::NameUnknown)?;
        match limit {
            Some(n) if n <= 0 => Ok(Vec::new()),
            _ => Ok(tx.search_image_tags(package.id, last, limit).await?),
        }
    }

    /// Canonical `owner/image` names of repositories with at least one
    /// pushed manifest, ascending, strictly after `last`.
    pub async fn list_repositories(&self, last: &str, limit: i64) -> RegistryResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        Ok(tx.search_repositories(last, limit).await?)
    }

    /// Record a pull of the version owning `descriptor`.
    pub async fn record_download(&self, descriptor: &BlobDescriptor) -> RegistryResult<()> {
        let mut tx = self.store.begin().await?;
        tx.increment_download_count(descriptor.version.id).await?;
        tx.commit().await?;
        Ok(())
    }
}
