//! Manifest ingestion.
//!
//! A push turns a manifest document into one package version: the blobs it
//! references become files of that version, and the manifest bytes become
//! its lead file. Everything happens in one metadata transaction; the only
//! content write is the manifest itself, which is removed again if the
//! transaction does not commit.

use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::blobs::{blob_file_name, check_count_quota, get_or_create_package};
use super::metadata::{Metadata, UNKNOWN_PLATFORM};
use super::oci::{self, Descriptor, ImageIndex, ImageManifest, Versioned};
use super::resolver::{find_one_in, find_versions_in, BlobDescriptor};
use super::{
    Digest, Reference, Registry, RegistryError, RegistryResult, Repository, MANIFEST_FILENAME,
    PROPERTY_DIGEST, PROPERTY_IMAGE_TAGGED, PROPERTY_MANIFEST_REFERENCE, PROPERTY_MEDIA_TYPE, UPLOAD_VERSION,
};
use crate::database::{
    self, FileSearchOptions, NewPackageBlob, NewPackageFile, NewPackageVersion, PackageTx, PackageVersion,
    PropertyType, StoreError,
};

/// Which branch of ingestion a manifest takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestKind {
    Image,
    Index,
}

/// A blob already present in the repository, paired with the descriptor
/// that references it.
struct BlobReference {
    descriptor: Descriptor,
    stored: BlobDescriptor,
}

/// Everything read and validated before the first write.
struct PreparedManifest {
    metadata: Metadata,
    references: Vec<BlobReference>,
    child_digests: Vec<String>,
}

fn invalid(err: impl std::fmt::Display) -> RegistryError {
    RegistryError::ManifestInvalid(err.to_string())
}

/// Media type without parameters such as `; charset=utf-8`.
fn essence(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

/// Pick the media type from the request header when it names a Docker or
/// OCI type, otherwise from the document.
fn resolve_media_type(content_type: Option<&str>, versioned: &Versioned) -> RegistryResult<(String, ManifestKind)> {
    let media_type = content_type
        .map(essence)
        .filter(|mt| oci::is_valid_media_type(mt))
        .or(versioned.media_type.as_deref())
        .unwrap_or_default();

    if oci::is_image_manifest_media_type(media_type) {
        Ok((media_type.to_string(), ManifestKind::Image))
    } else if oci::is_image_index_media_type(media_type) {
        Ok((media_type.to_string(), ManifestKind::Index))
    } else {
        Err(RegistryError::Unsupported(format!("Manifest media type {media_type:?} is not supported")))
    }
}

fn parse_digest(value: &str) -> RegistryResult<Digest> {
    value
        .parse()
        .map_err(|_| RegistryError::ManifestInvalid(format!("Invalid digest {value:?} in manifest")))
}

fn check_declared_size(descriptor: &Descriptor, stored: &BlobDescriptor) -> RegistryResult<()> {
    if descriptor.size != stored.blob.size {
        return Err(RegistryError::SizeInvalid(format!(
            "{} declares {} bytes, stored blob has {}",
            descriptor.digest, descriptor.size, stored.blob.size
        )));
    }
    Ok(())
}

impl Registry {
    /// Ingest a manifest pushed to `repo` under `reference` and return its
    /// digest.
    #[instrument(skip(self, body, creator), fields(repository = %repo, reference = %reference))]
    pub async fn process_manifest(
        &self,
        repo: &Repository,
        reference: &Reference,
        content_type: Option<&str>,
        body: Bytes,
        creator: &str,
    ) -> RegistryResult<Digest> {
        if body.len() > self.options.max_manifest_size {
            return Err(RegistryError::ManifestTooLarge(self.options.max_manifest_size));
        }

        let versioned: Versioned = serde_json::from_slice(&body).map_err(invalid)?;
        if versioned.schema_version != 2 {
            return Err(RegistryError::Unsupported(format!(
                "Schema version {} is not supported",
                versioned.schema_version
            )));
        }
        let (media_type, kind) = resolve_media_type(content_type, &versioned)?;

        let digest = Digest::of(&body);
        match reference {
            Reference::Digest(expected) if expected != &digest => {
                return Err(RegistryError::DigestInvalid(format!("expected {expected}, computed {digest}")));
            }
            Reference::Tag(tag) if tag.eq_ignore_ascii_case(UPLOAD_VERSION) => {
                return Err(RegistryError::ManifestInvalid("Tag is invalid".to_string()));
            }
            _ => {}
        }

        let mut tx = self.store.begin().await?;
        tx.lock_package(&repo.owner, repo.image.as_str()).await?;

        let mut prepared = match kind {
            ManifestKind::Image => self.prepare_image_manifest(tx.as_mut(), repo, &body).await?,
            ManifestKind::Index => prepare_image_index(tx.as_mut(), repo, &body).await?,
        };
        prepared.metadata.is_tagged = reference.is_tag();

        let version = self
            .create_package_and_version(tx.as_mut(), repo, reference, creator, &prepared)
            .await?;
        for reference in &prepared.references {
            create_file_from_blob_reference(tx.as_mut(), repo, &version, reference).await?;
        }

        let (blob, exists) = tx
            .get_or_insert_blob(&NewPackageBlob {
                size: body.len() as i64,
                hash_sha256: digest.hex().to_string(),
            })
            .await?;

        let outcome: RegistryResult<()> = async {
            if !exists {
                self.storage.put_blob(&blob.hash_sha256, body.clone()).await?;
            }
            let file = tx
                .insert_file(&NewPackageFile {
                    version_id: version.id,
                    blob_id: blob.id,
                    name: MANIFEST_FILENAME.to_string(),
                    is_lead: true,
                })
                .await?;
            tx.insert_property(PropertyType::File, file.id, PROPERTY_MEDIA_TYPE, &media_type)
                .await?;
            tx.insert_property(PropertyType::File, file.id, PROPERTY_DIGEST, digest.as_str())
                .await?;
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

        metrics::counter!("registry_manifest_pushes_total").increment(1);
        info!(digest = %digest, media_type = %media_type, "Pushed manifest");
        Ok(digest)
    }

    async fn prepare_image_manifest(
        &self,
        tx: &mut dyn PackageTx,
        repo: &Repository,
        body: &[u8],
    ) -> RegistryResult<PreparedManifest> {
        let manifest: ImageManifest = serde_json::from_slice(body).map_err(invalid)?;
        let config_media_type = manifest.config.media_type.as_str();
        if !oci::is_valid_media_type(config_media_type)
            && !config_media_type.eq_ignore_ascii_case(oci::MEDIA_TYPE_HELM_CONFIG)
        {
            return Err(RegistryError::ManifestInvalid(format!(
                "Config media type {:?} is not recognized",
                manifest.config.media_type
            )));
        }

        let mut references = Vec::with_capacity(manifest.layers.len() + 1);
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            let digest = parse_digest(&descriptor.digest)?;
            let opts = FileSearchOptions::for_repository(repo).with_digest(&digest);
            let stored = find_one_in(tx, &opts)
                .await?
                .ok_or_else(|| RegistryError::ManifestBlobUnknown(descriptor.digest.clone()))?;
            check_declared_size(descriptor, &stored)?;
            references.push(BlobReference {
                descriptor: descriptor.clone(),
                stored,
            });
        }

        let config = &references[0].stored;
        let content = self
            .storage
            .get_blob(&config.blob.hash_sha256)
            .await?
            .ok_or_else(|| RegistryError::ManifestBlobUnknown(manifest.config.digest.clone()))?;
        let metadata = Metadata::from_config(&manifest.config.media_type, &content)
            .map_err(|err| RegistryError::ManifestInvalid(format!("Unreadable config blob: {err}")))?;

        Ok(PreparedManifest {
            metadata,
            references,
            child_digests: Vec::new(),
        })
    }

    /// Create the version for `reference`, replacing any earlier push of the
    /// same reference. The replacement keeps the download counter.
    async fn create_package_and_version(
        &self,
        tx: &mut dyn PackageTx,
        repo: &Repository,
        reference: &Reference,
        creator: &str,
        prepared: &PreparedManifest,
    ) -> RegistryResult<PackageVersion> {
        let package = get_or_create_package(tx, repo).await?;
        let lower_version = reference.as_str().to_lowercase();

        let mut download_count = 0;
        if let Some(existing) = tx.get_version_by_name(package.id, &lower_version).await? {
            debug!(version_id = existing.id, "Overwriting existing version");
            download_count = existing.download_count;
            database::delete_version_and_references(tx, &existing).await?;
        }

        check_count_quota(tx, &self.options.limits, &repo.owner).await?;

        let (version, _) = tx
            .get_or_insert_version(&NewPackageVersion {
                package_id: package.id,
                creator: creator.to_string(),
                version: reference.as_str().to_string(),
                is_internal: false,
                metadata_json: serde_json::to_string(&prepared.metadata).map_err(StoreError::from)?,
                download_count,
            })
            .await?;

        if prepared.metadata.is_tagged {
            tx.insert_property(PropertyType::Version, version.id, PROPERTY_IMAGE_TAGGED, "")
                .await?;
        }
        for child in &prepared.child_digests {
            tx.insert_property(PropertyType::Version, version.id, PROPERTY_MANIFEST_REFERENCE, child)
                .await?;
        }
        Ok(version)
    }

    /// The lead file of the manifest `reference` points at. Matches whose
    /// bytes are gone from the content store count as unknown.
    pub async fn find_manifest(&self, repo: &Repository, reference: &Reference) -> RegistryResult<BlobDescriptor> {
        self.find_stored(&manifest_search(repo, reference))
            .await?
            .ok_or(RegistryError::ManifestUnknown)
    }

    /// Delete every version the manifest search for `reference` finds.
    #[instrument(skip(self), fields(repository = %repo, reference = %reference))]
    pub async fn delete_manifest(&self, repo: &Repository, reference: &Reference) -> RegistryResult<()> {
        let mut tx = self.store.begin().await?;
        tx.lock_package(&repo.owner, repo.image.as_str()).await?;

        let versions = find_versions_in(tx.as_mut(), &manifest_search(repo, reference)).await?;
        if versions.is_empty() {
            return Err(RegistryError::ManifestUnknown);
        }
        for version in &versions {
            database::delete_version_and_references(tx.as_mut(), version).await?;
        }
        tx.commit().await?;

        info!(versions = versions.len(), "Deleted manifest");
        Ok(())
    }
}

fn manifest_search(repo: &Repository, reference: &Reference) -> FileSearchOptions {
    let opts = FileSearchOptions::for_repository(repo).manifests_only();
    match reference {
        Reference::Digest(digest) => opts.with_digest(digest),
        Reference::Tag(tag) => opts.with_tag(tag),
    }
}

async fn prepare_image_index(tx: &mut dyn PackageTx, repo: &Repository, body: &[u8]) -> RegistryResult<PreparedManifest> {
    let index: ImageIndex = serde_json::from_slice(body).map_err(invalid)?;

    let mut metadata = Metadata::for_index();
    let mut child_digests = Vec::with_capacity(index.manifests.len());
    for child in &index.manifests {
        if !oci::is_image_manifest_media_type(&child.media_type) {
            return Err(RegistryError::ManifestInvalid(format!(
                "Index entry {} has unsupported media type {:?}",
                child.digest, child.media_type
            )));
        }
        let digest = parse_digest(&child.digest)?;
        let opts = FileSearchOptions::for_repository(repo)
            .with_digest(&digest)
            .manifests_only();
        let stored = find_one_in(tx, &opts)
            .await?
            .ok_or_else(|| RegistryError::ManifestBlobUnknown(child.digest.clone()))?;

        let mut size = 0;
        for file in tx.get_files_by_version(stored.version.id).await? {
            if let Some(blob) = tx.get_blob_by_id(file.blob_id).await? {
                size += blob.size;
            }
        }

        let platform = child
            .platform
            .as_ref()
            .map(|platform| platform.to_string())
            .unwrap_or_else(|| UNKNOWN_PLATFORM.to_string());
        metadata.add_manifest(platform, digest.as_str().to_string(), size);
        child_digests.push(digest.as_str().to_string());
    }

    Ok(PreparedManifest {
        metadata,
        references: Vec::new(),
        child_digests,
    })
}

/// Attach a referenced blob to `version` and move it out of the upload
/// version if it was still parked there.
async fn create_file_from_blob_reference(
    tx: &mut dyn PackageTx,
    repo: &Repository,
    version: &PackageVersion,
    reference: &BlobReference,
) -> RegistryResult<()> {
    check_declared_size(&reference.descriptor, &reference.stored)?;

    let blob = &reference.stored.blob;
    let name = blob_file_name(&blob.hash_sha256);
    let file = match tx
        .insert_file(&NewPackageFile {
            version_id: version.id,
            blob_id: blob.id,
            name: name.clone(),
            is_lead: false,
        })
        .await
    {
        Ok(file) => file,
        // The same layer listed twice collapses into one file
        Err(StoreError::Duplicate) => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    tx.insert_property(PropertyType::File, file.id, PROPERTY_MEDIA_TYPE, &reference.descriptor.media_type)
        .await?;
    tx.insert_property(PropertyType::File, file.id, PROPERTY_DIGEST, &reference.descriptor.digest)
        .await?;

    if let Some(package) = tx.get_package_by_name(&repo.owner, repo.image.as_str()).await? {
        if let Some(upload_version) = tx.get_version_by_name(package.id, UPLOAD_VERSION).await? {
            if let Some(parked) = tx.get_file_by_name(upload_version.id, &name).await? {
                database::delete_file(tx, &parked).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryPackageStore, PackageStore};
    use crate::registry::{ImageName, QuotaLimits, RegistryOptions};
    use crate::storage::MemoryStorage;
    use futures::stream;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        registry: Registry,
        store: MemoryPackageStore,
        storage: MemoryStorage,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = MemoryPackageStore::new();
        let storage = MemoryStorage::new();
        let registry = Registry::new(
            Arc::new(store.clone()),
            Arc::new(storage.clone()),
            RegistryOptions {
                upload_dir: dir.path().to_path_buf(),
                max_manifest_size: 10 * 1024 * 1024,
                limits: QuotaLimits::default(),
            },
        );
        Fixture {
            registry,
            store,
            storage,
            _dir: dir,
        }
    }

    fn repo() -> Repository {
        Repository::new("alice", "app".parse::<ImageName>().unwrap())
    }

    async fn push_blob(registry: &Registry, content: &'static [u8]) -> Digest {
        let digest = Digest::of(content);
        let body = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(content))]);
        let buffer = registry.spool_body(body).await.unwrap();
        registry
            .finish_monolithic_upload(&repo(), "alice", buffer, &digest)
            .await
            .unwrap();
        digest
    }

    fn image_manifest(config: &Digest, config_size: usize, layer: &Digest, layer_size: usize) -> Bytes {
        Bytes::from(
            json!({
                "schemaVersion": 2,
                "mediaType": oci::MEDIA_TYPE_OCI_MANIFEST,
                "config": {
                    "mediaType": "application/vnd.oci.image.config.v1+json",
                    "digest": config.as_str(),
                    "size": config_size,
                },
                "layers": [{
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": layer.as_str(),
                    "size": layer_size,
                }],
            })
            .to_string(),
        )
    }

    const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;
    const LAYER: &[u8] = b"layer bytes";

    #[tokio::test]
    async fn test_push_by_tag_then_resolve() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let body = image_manifest(&config, CONFIG.len(), &layer, LAYER.len());

        let tag: Reference = "v1".parse().unwrap();
        let digest = fx
            .registry
            .process_manifest(&repo(), &tag, None, body.clone(), "alice")
            .await
            .unwrap();
        assert_eq!(digest, Digest::of(&body));

        let by_tag = fx.registry.find_manifest(&repo(), &tag).await.unwrap();
        let by_digest = fx
            .registry
            .find_manifest(&repo(), &Reference::Digest(digest.clone()))
            .await
            .unwrap();
        assert_eq!(by_tag.file.id, by_digest.file.id);
        assert_eq!(by_tag.media_type(), Some(oci::MEDIA_TYPE_OCI_MANIFEST));

        let metadata: Metadata = serde_json::from_str(&by_tag.version.metadata_json).unwrap();
        assert_eq!(metadata.platform, "linux/amd64");
        assert!(metadata.is_tagged);

        // Both blobs moved out of the upload version
        let mut tx = fx.store.begin().await.unwrap();
        let package = tx.get_package_by_name("alice", "app").await.unwrap().unwrap();
        let upload = tx.get_version_by_name(package.id, UPLOAD_VERSION).await.unwrap().unwrap();
        assert!(tx.get_files_by_version(upload.id).await.unwrap().is_empty());
        assert_eq!(tx.get_files_by_version(by_tag.version.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_layer_is_manifest_blob_unknown() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let missing = Digest::of(b"never uploaded");
        let body = image_manifest(&config, CONFIG.len(), &missing, 14);

        let err = fx
            .registry
            .process_manifest(&repo(), &"v1".parse().unwrap(), None, body, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestBlobUnknown(_)));
    }

    #[tokio::test]
    async fn test_size_mismatch_creates_nothing() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let before = fx.store.stats().await;
        let writes = fx.storage.write_count();

        let body = image_manifest(&config, CONFIG.len(), &layer, LAYER.len() + 1);
        let err = fx
            .registry
            .process_manifest(&repo(), &"v1".parse().unwrap(), None, body, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::SizeInvalid(_)));
        assert_eq!(fx.store.stats().await, before);
        assert_eq!(fx.storage.write_count(), writes);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_download_count() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let tag: Reference = "latest".parse().unwrap();

        let first = image_manifest(&config, CONFIG.len(), &layer, LAYER.len());
        fx.registry
            .process_manifest(&repo(), &tag, None, first, "alice")
            .await
            .unwrap();
        let found = fx.registry.find_manifest(&repo(), &tag).await.unwrap();
        fx.registry.record_download(&found).await.unwrap();
        fx.registry.record_download(&found).await.unwrap();

        // Same blobs, different bytes: a reformatted document
        let second = Bytes::from(format!("{}\n", String::from_utf8_lossy(&image_manifest(&config, CONFIG.len(), &layer, LAYER.len()))));
        let digest = fx
            .registry
            .process_manifest(&repo(), &tag, None, second, "alice")
            .await
            .unwrap();

        let found = fx.registry.find_manifest(&repo(), &tag).await.unwrap();
        assert_eq!(found.digest(), digest.as_str());
        assert_eq!(found.version.download_count, 2);
        assert_eq!(fx.registry.list_tags(&repo(), "", None).await.unwrap(), vec!["latest"]);
    }

    #[tokio::test]
    async fn test_push_by_digest_mismatch_and_reserved_tag() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let body = image_manifest(&config, CONFIG.len(), &layer, LAYER.len());

        let wrong = Reference::Digest(Digest::of(b"other"));
        let err = fx
            .registry
            .process_manifest(&repo(), &wrong, None, body.clone(), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestInvalid(_)));

        let reserved = Reference::Tag(UPLOAD_VERSION.to_string());
        let err = fx
            .registry
            .process_manifest(&repo(), &reserved, None, body, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestInvalid(_)));
    }

    #[tokio::test]
    async fn test_rejects_unknown_schema_and_media_type() {
        let fx = fixture();
        let tag: Reference = "v1".parse().unwrap();

        let v1 = Bytes::from(json!({"schemaVersion": 1}).to_string());
        let err = fx.registry.process_manifest(&repo(), &tag, None, v1, "alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported(_)));

        let odd = Bytes::from(json!({"schemaVersion": 2, "mediaType": "text/plain"}).to_string());
        let err = fx.registry.process_manifest(&repo(), &tag, None, odd, "alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unsupported(_)));

        let garbage = Bytes::from_static(b"{not json");
        let err = fx.registry.process_manifest(&repo(), &tag, None, garbage, "alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::ManifestInvalid(_)));
    }

    #[tokio::test]
    async fn test_index_references_existing_manifests() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let child = image_manifest(&config, CONFIG.len(), &layer, LAYER.len());
        let child_digest = Digest::of(&child);
        fx.registry
            .process_manifest(&repo(), &Reference::Digest(child_digest.clone()), None, child.clone(), "alice")
            .await
            .unwrap();

        let index = Bytes::from(
            json!({
                "schemaVersion": 2,
                "mediaType": oci::MEDIA_TYPE_OCI_INDEX,
                "manifests": [{
                    "mediaType": oci::MEDIA_TYPE_OCI_MANIFEST,
                    "digest": child_digest.as_str(),
                    "size": child.len(),
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"},
                }],
            })
            .to_string(),
        );
        let tag: Reference = "multi".parse().unwrap();
        fx.registry
            .process_manifest(&repo(), &tag, Some("application/json"), index, "alice")
            .await
            .unwrap();

        let found = fx.registry.find_manifest(&repo(), &tag).await.unwrap();
        assert_eq!(found.media_type(), Some(oci::MEDIA_TYPE_OCI_INDEX));
        let metadata: Metadata = serde_json::from_str(&found.version.metadata_json).unwrap();
        assert_eq!(metadata.multi_arch.get("linux/arm64/v8"), Some(&child_digest.as_str().to_string()));
        assert_eq!(metadata.manifests[0].size, (CONFIG.len() + LAYER.len() + child.len()) as i64);

        // Pushing by digest leaves the child untagged
        assert_eq!(fx.registry.list_tags(&repo(), "", None).await.unwrap(), vec!["multi"]);
    }

    #[tokio::test]
    async fn test_index_with_unknown_child() {
        let fx = fixture();
        let index = Bytes::from(
            json!({
                "schemaVersion": 2,
                "mediaType": oci::MEDIA_TYPE_DOCKER_MANIFEST_LIST,
                "manifests": [{
                    "mediaType": oci::MEDIA_TYPE_DOCKER_MANIFEST,
                    "digest": Digest::of(b"absent").as_str(),
                    "size": 10,
                }],
            })
            .to_string(),
        );
        let err = fx
            .registry
            .process_manifest(&repo(), &"v1".parse().unwrap(), None, index, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestBlobUnknown(_)));
    }

    #[tokio::test]
    async fn test_delete_manifest() {
        let fx = fixture();
        let config = push_blob(&fx.registry, CONFIG).await;
        let layer = push_blob(&fx.registry, LAYER).await;
        let body = image_manifest(&config, CONFIG.len(), &layer, LAYER.len());
        let tag: Reference = "v1".parse().unwrap();
        fx.registry
            .process_manifest(&repo(), &tag, None, body, "alice")
            .await
            .unwrap();

        fx.registry.delete_manifest(&repo(), &tag).await.unwrap();
        assert!(matches!(
            fx.registry.find_manifest(&repo(), &tag).await,
            Err(RegistryError::ManifestUnknown)
        ));
        assert!(matches!(
            fx.registry.delete_manifest(&repo(), &tag).await,
            Err(RegistryError::ManifestUnknown)
        ));
    }

    #[tokio::test]
    async fn test_manifest_too_large() {
        let fx = fixture();
        let body = Bytes::from(vec![b' '; fx.registry.options().max_manifest_size + 1]);
        let err = fx
            .registry
            .process_manifest(&repo(), &"v1".parse().unwrap(), None, body, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestTooLarge(_)));
    }
}
