//! Container registry core: blob resolution, upload sessions, manifest
//! ingestion and cleanup, all on top of the package metadata model.

pub mod blobs;
pub mod cleanup;
pub mod digest;
pub mod error;
pub mod hasher;
pub mod manifest;
pub mod metadata;
pub mod oci;
pub mod resolver;
pub mod uploader;

pub use digest::{Digest, ImageName, Reference};
pub use error::{RegistryError, RegistryResult};

use std::path::PathBuf;
use std::sync::Arc;

use crate::database::PackageStore;
use crate::storage::Storage;

/// File name of the lead file holding a manifest's own bytes.
pub const MANIFEST_FILENAME: &str = "manifest.json";
/// Reserved version that parks blobs between upload and manifest push.
pub const UPLOAD_VERSION: &str = "_upload";

pub const PROPERTY_REPOSITORY: &str = "container.repository";
pub const PROPERTY_DIGEST: &str = "container.digest";
pub const PROPERTY_MEDIA_TYPE: &str = "container.mediatype";
pub const PROPERTY_IMAGE_TAGGED: &str = "container.image.tagged";
pub const PROPERTY_MANIFEST_REFERENCE: &str = "container.manifest.reference";

/// Limits applied before new package data is written. `-1` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub total_owner_count: i64,
    pub total_owner_size: i64,
    pub size_container: i64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            total_owner_count: -1,
            total_owner_size: -1,
            size_container: -1,
        }
    }
}

/// Lowercased owner and image name of one repository, e.g. `alice` / `tools/app`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub owner: String,
    pub image: ImageName,
}

impl Repository {
    pub fn new(owner: &str, image: ImageName) -> Self {
        Self {
            owner: owner.to_lowercase(),
            image,
        }
    }

    /// Split a full `owner/image` name. The name is lowercased and must
    /// match the image name pattern; the image part may contain `/`.
    pub fn parse(full_name: &str) -> RegistryResult<Self> {
        let lower = full_name.to_lowercase();
        lower
            .parse::<ImageName>()
            .map_err(|err| RegistryError::NameInvalid(err.to_string()))?;
        let (owner, image) = lower
            .split_once('/')
            .ok_or_else(|| RegistryError::NameInvalid(format!("{full_name} has no owner")))?;
        let image = image
            .parse::<ImageName>()
            .map_err(|err| RegistryError::NameInvalid(err.to_string()))?;
        Ok(Self::new(owner, image))
    }

    /// Canonical `owner/image` form stored on the package.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.image.as_str())
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.image.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Directory holding upload session scratch files.
    pub upload_dir: PathBuf,
    pub max_manifest_size: usize,
    pub limits: QuotaLimits,
}

/// Handle on the metadata store and the content store, passed to every
/// registry operation.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn PackageStore>,
    storage: Arc<dyn Storage>,
    options: Arc<RegistryOptions>,
}

impl Registry {
    pub fn new(
        store: Arc<dyn PackageStore>,
        storage: Arc<dyn Storage>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            store,
            storage,
            options: Arc::new(options),
        }
    }

    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Best-effort removal of content bytes written by a failed operation.
    async fn discard_content(&self, hash_sha256: &str) {
        if let Err(err) = self.storage.delete_blob(hash_sha256).await {
            tracing::warn!(
                hash = %hash_sha256,
                error = %err,
                "Failed to remove content after aborted write"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_parse() {
        let repo = Repository::parse("Alice/Tools/App").unwrap();
        assert_eq!(repo.owner, "alice");
        assert_eq!(repo.image.as_str(), "tools/app");
        assert_eq!(repo.full_name(), "alice/tools/app");

        assert!(matches!(Repository::parse("app"), Err(RegistryError::NameInvalid(_))));
        assert!(matches!(Repository::parse("alice/-bad"), Err(RegistryError::NameInvalid(_))));
        assert!(matches!(Repository::parse("alice//app"), Err(RegistryError::NameInvalid(_))));
    }
}
