use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::*;
use super::{PackageStore, PackageTx, StoreError, StoreResult};
use crate::registry::{MANIFEST_FILENAME, PROPERTY_DIGEST, PROPERTY_IMAGE_TAGGED, PROPERTY_REPOSITORY};

/// Metadata store held in process memory.
///
/// A transaction takes the single store lock for its whole lifetime and works
/// on a copy of the state, which replaces the shared state on commit. Writers
/// are therefore fully serialized.
#[derive(Clone, Default)]
pub struct MemoryPackageStore {
    state: Arc<Mutex<MemoryState>>,
    failing_commits: Arc<AtomicUsize>,
}

#[derive(Clone, Default)]
struct MemoryState {
    next_id: i64,
    packages: BTreeMap<i64, Package>,
    versions: BTreeMap<i64, PackageVersion>,
    blobs: BTreeMap<i64, PackageBlob>,
    files: BTreeMap<i64, PackageFile>,
    properties: BTreeMap<i64, PackageProperty>,
    uploads: HashMap<String, BlobUpload>,
}

/// Row counts, mostly useful for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub packages: usize,
    pub versions: usize,
    pub blobs: usize,
    pub files: usize,
    pub properties: usize,
    pub uploads: usize,
}

impl MemoryPackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> MemoryStats {
        let state = self.state.lock().await;
        MemoryStats {
            packages: state.packages.len(),
            versions: state.versions.len(),
            blobs: state.blobs.len(),
            files: state.files.len(),
            properties: state.properties.len(),
            uploads: state.uploads.len(),
        }
    }

    /// Make the next `count` commits fail and discard their changes.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackageStore for MemoryPackageStore {
    async fn begin(&self) -> StoreResult<Box<dyn PackageTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryPackageTx {
            guard,
            working,
            failing_commits: self.failing_commits.clone(),
        }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub struct MemoryPackageTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    failing_commits: Arc<AtomicUsize>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_property(&self, ref_type: PropertyType, ref_id: i64, name: &str, value: Option<&str>) -> bool {
        self.properties.values().any(|p| {
            p.ref_type == ref_type
                && p.ref_id == ref_id
                && p.name == name
                && value.map_or(true, |v| p.value == v)
        })
    }

    fn version_has_files(&self, version_id: i64) -> bool {
        self.files.values().any(|f| f.version_id == version_id)
    }

    fn file_matches(&self, file: &PackageFile, opts: &FileSearchOptions) -> bool {
        let Some(version) = self.versions.get(&file.version_id) else {
            return false;
        };
        let Some(package) = self.packages.get(&version.package_id) else {
            return false;
        };

        if opts.owner.as_deref().is_some_and(|owner| package.owner != owner) {
            return false;
        }
        if opts.image.as_deref().is_some_and(|image| package.lower_name != image) {
            return false;
        }
        if let Some(tag) = opts.tag.as_deref() {
            if version.lower_version != tag || version.is_internal {
                return false;
            }
        }
        if let Some(digest) = opts.digest.as_deref() {
            if !self.has_property(PropertyType::File, file.id, PROPERTY_DIGEST, Some(digest)) {
                return false;
            }
        }
        if let Some(repository) = opts.repository.as_deref() {
            if !self.has_property(PropertyType::Package, package.id, PROPERTY_REPOSITORY, Some(repository)) {
                return false;
            }
        }
        if opts.is_manifest && file.lower_name != MANIFEST_FILENAME {
            return false;
        }
        true
    }
}

fn take_limit<T>(items: impl Iterator<Item = T>, limit: Option<i64>) -> Vec<T> {
    match limit {
        Some(n) => items.take(n.max(0) as usize).collect(),
        None => items.collect(),
    }
}

#[async_trait]
impl PackageTx for MemoryPackageTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryPackageTx {
            mut guard,
            working,
            failing_commits,
        } = *self;
        let fail = failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        *guard = working;
        Ok(())
    }

    async fn lock_package(&mut self, _owner: &str, _lower_name: &str) -> StoreResult<()> {
        // The store lock is already held for the whole transaction.
        Ok(())
    }

    async fn get_or_insert_package(&mut self, package: &NewPackage) -> StoreResult<(Package, bool)> {
        let lower_name = package.name.to_lowercase();
        if let Some(existing) = self.get_package_by_name(&package.owner, &lower_name).await? {
            return Ok((existing, false));
        }
        let row = Package {
            id: self.working.next_id(),
            owner: package.owner.clone(),
            name: package.name.clone(),
            lower_name,
            created_at: Utc::now(),
        };
        self.working.packages.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn get_package_by_name(&mut self, owner: &str, lower_name: &str) -> StoreResult<Option<Package>> {
        Ok(self
            .working
            .packages
            .values()
            .find(|p| p.owner == owner && p.lower_name == lower_name)
            .cloned())
    }

    async fn delete_package(&mut self, package_id: i64) -> StoreResult<()> {
        self.working.packages.remove(&package_id);
        Ok(())
    }

    async fn find_packages_without_versions(&mut self) -> StoreResult<Vec<Package>> {
        let state = &self.working;
        Ok(state
            .packages
            .values()
            .filter(|p| !state.versions.values().any(|v| v.package_id == p.id))
            .cloned()
            .collect())
    }

    async fn search_repositories(&mut self, last: &str, limit: i64) -> StoreResult<Vec<String>> {
        let state = &self.working;
        let mut names: Vec<String> = state
            .properties
            .values()
            .filter(|p| p.ref_type == PropertyType::Package && p.name == PROPERTY_REPOSITORY)
            .filter(|p| p.value.as_str() > last)
            .filter(|p| {
                state
                    .versions
                    .values()
                    .any(|v| v.package_id == p.ref_id && !v.is_internal)
            })
            .map(|p| p.value.clone())
            .collect();
        names.sort();
        Ok(take_limit(names.into_iter(), Some(limit)))
    }

    async fn get_or_insert_version(&mut self, version: &NewPackageVersion) -> StoreResult<(PackageVersion, bool)> {
        let lower_version = version.version.to_lowercase();
        if let Some(existing) = self.get_version_by_name(version.package_id, &lower_version).await? {
            return Ok((existing, false));
        }
        let row = PackageVersion {
            id: self.working.next_id(),
            package_id: version.package_id,
            creator: version.creator.clone(),
            version: version.version.clone(),
            lower_version,
            is_internal: version.is_internal,
            metadata_json: version.metadata_json.clone(),
            download_count: version.download_count,
            created_at: Utc::now(),
        };
        self.working.versions.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn get_version_by_id(&mut self, version_id: i64) -> StoreResult<Option<PackageVersion>> {
        Ok(self.working.versions.get(&version_id).cloned())
    }

    async fn get_version_by_name(&mut self, package_id: i64, lower_version: &str) -> StoreResult<Option<PackageVersion>> {
        Ok(self
            .working
            .versions
            .values()
            .find(|v| v.package_id == package_id && v.lower_version == lower_version)
            .cloned())
    }

    async fn delete_version(&mut self, version_id: i64) -> StoreResult<()> {
        self.working.versions.remove(&version_id);
        Ok(())
    }

    async fn increment_download_count(&mut self, version_id: i64) -> StoreResult<()> {
        let version = self
            .working
            .versions
            .get_mut(&version_id)
            .ok_or(StoreError::NotFound)?;
        version.download_count += 1;
        Ok(())
    }

    async fn count_owner_versions(&mut self, owner: &str) -> StoreResult<i64> {
        let state = &self.working;
        let count = state
            .versions
            .values()
            .filter(|v| !v.is_internal)
            .filter(|v| state.packages.get(&v.package_id).is_some_and(|p| p.owner == owner))
            .count();
        Ok(count as i64)
    }

    async fn find_empty_internal_versions(&mut self, lower_version: &str) -> StoreResult<Vec<PackageVersion>> {
        let state = &self.working;
        Ok(state
            .versions
            .values()
            .filter(|v| v.is_internal && v.lower_version == lower_version)
            .filter(|v| !state.version_has_files(v.id))
            .cloned()
            .collect())
    }

    async fn search_image_tags(&mut self, package_id: i64, last: &str, limit: Option<i64>) -> StoreResult<Vec<String>> {
        let state = &self.working;
        let last = last.to_lowercase();
        let mut tagged: Vec<&PackageVersion> = state
            .versions
            .values()
            .filter(|v| v.package_id == package_id && !v.is_internal)
            .filter(|v| v.lower_version > last)
            .filter(|v| state.has_property(PropertyType::Version, v.id, PROPERTY_IMAGE_TAGGED, None))
            .collect();
        tagged.sort_by(|a, b| a.lower_version.cmp(&b.lower_version));
        Ok(take_limit(tagged.into_iter().map(|v| v.version.clone()), limit))
    }

    async fn get_or_insert_blob(&mut self, blob: &NewPackageBlob) -> StoreResult<(PackageBlob, bool)> {
        if let Some(existing) = self
            .working
            .blobs
            .values()
            .find(|b| b.hash_sha256 == blob.hash_sha256)
        {
            return Ok((existing.clone(), true));
        }
        let row = PackageBlob {
            id: self.working.next_id(),
            size: blob.size,
            hash_sha256: blob.hash_sha256.clone(),
            created_at: Utc::now(),
        };
        self.working.blobs.insert(row.id, row.clone());
        Ok((row, false))
    }

    async fn get_blob_by_id(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>> {
        Ok(self.working.blobs.get(&blob_id).cloned())
    }

    async fn delete_unreferenced_blob(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>> {
        if self.working.files.values().any(|f| f.blob_id == blob_id) {
            return Ok(None);
        }
        Ok(self.working.blobs.remove(&blob_id))
    }

    async fn find_unreferenced_blobs(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageBlob>> {
        let state = &self.working;
        Ok(state
            .blobs
            .values()
            .filter(|b| b.created_at < older_than)
            .filter(|b| !state.files.values().any(|f| f.blob_id == b.id))
            .cloned()
            .collect())
    }

    async fn insert_file(&mut self, file: &NewPackageFile) -> StoreResult<PackageFile> {
        let lower_name = file.name.to_lowercase();
        if self.get_file_by_name(file.version_id, &lower_name).await?.is_some() {
            return Err(StoreError::Duplicate);
        }
        let row = PackageFile {
            id: self.working.next_id(),
            version_id: file.version_id,
            blob_id: file.blob_id,
            name: file.name.clone(),
            lower_name,
            is_lead: file.is_lead,
            created_at: Utc::now(),
        };
        self.working.files.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_file_by_name(&mut self, version_id: i64, lower_name: &str) -> StoreResult<Option<PackageFile>> {
        Ok(self
            .working
            .files
            .values()
            .find(|f| f.version_id == version_id && f.lower_name == lower_name)
            .cloned())
    }

    async fn get_files_by_version(&mut self, version_id: i64) -> StoreResult<Vec<PackageFile>> {
        Ok(self
            .working
            .files
            .values()
            .filter(|f| f.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn delete_file(&mut self, file_id: i64) -> StoreResult<()> {
        self.working.files.remove(&file_id);
        Ok(())
    }

    async fn sum_owner_file_size(&mut self, owner: &str) -> StoreResult<i64> {
        let state = &self.working;
        let total = state
            .files
            .values()
            .filter(|f| {
                state
                    .versions
                    .get(&f.version_id)
                    .and_then(|v| state.packages.get(&v.package_id))
                    .is_some_and(|p| p.owner == owner)
            })
            .filter_map(|f| state.blobs.get(&f.blob_id))
            .map(|b| b.size)
            .sum();
        Ok(total)
    }

    async fn find_expired_internal_files(&mut self, lower_version: &str, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageFile>> {
        let state = &self.working;
        Ok(state
            .files
            .values()
            .filter(|f| f.created_at < older_than)
            .filter(|f| {
                state
                    .versions
                    .get(&f.version_id)
                    .is_some_and(|v| v.is_internal && v.lower_version == lower_version)
            })
            .cloned()
            .collect())
    }

    async fn search_files(&mut self, opts: &FileSearchOptions, limit: Option<i64>) -> StoreResult<Vec<PackageFile>> {
        let state = &self.working;
        let matches = state
            .files
            .values()
            .filter(|f| state.file_matches(f, opts))
            .cloned();
        Ok(take_limit(matches, limit))
    }

    async fn insert_property(&mut self, ref_type: PropertyType, ref_id: i64, name: &str, value: &str) -> StoreResult<PackageProperty> {
        let row = PackageProperty {
            id: self.working.next_id(),
            ref_type,
            ref_id,
            name: name.to_string(),
            value: value.to_string(),
        };
        self.working.properties.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<Vec<PackageProperty>> {
        Ok(self
            .working
            .properties
            .values()
            .filter(|p| p.ref_type == ref_type && p.ref_id == ref_id)
            .cloned()
            .collect())
    }

    async fn delete_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<()> {
        self.working
            .properties
            .retain(|_, p| !(p.ref_type == ref_type && p.ref_id == ref_id));
        Ok(())
    }

    async fn create_blob_upload(&mut self, id: &str, hash_state: &str) -> StoreResult<BlobUpload> {
        if self.working.uploads.contains_key(id) {
            return Err(StoreError::Duplicate);
        }
        let now = Utc::now();
        let row = BlobUpload {
            id: id.to_string(),
            bytes_received: 0,
            hash_state: hash_state.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.working.uploads.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_blob_upload(&mut self, id: &str) -> StoreResult<Option<BlobUpload>> {
        Ok(self.working.uploads.get(id).cloned())
    }

    async fn update_blob_upload(&mut self, id: &str, expected_bytes_received: i64, bytes_received: i64, hash_state: &str) -> StoreResult<()> {
        match self.working.uploads.get_mut(id) {
            Some(upload) if upload.bytes_received == expected_bytes_received => {
                upload.bytes_received = bytes_received;
                upload.hash_state = hash_state.to_string();
                upload.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }

    async fn delete_blob_upload(&mut self, id: &str) -> StoreResult<()> {
        self.working.uploads.remove(id);
        Ok(())
    }

    async fn find_expired_blob_uploads(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<BlobUpload>> {
        let mut rows: Vec<BlobUpload> = self
            .working
            .uploads
            .values()
            .filter(|u| u.created_at < older_than)
            .cloned()
            .collect();
        rows.sort_by_key(|u| u.created_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn package(tx: &mut Box<dyn PackageTx>, name: &str) -> Package {
        let (package, _) = tx
            .get_or_insert_package(&NewPackage { owner: "alice".into(), name: name.into() })
            .await
            .unwrap();
        package
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let store = MemoryPackageStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            package(&mut tx, "dropped").await;
        }
        assert_eq!(store.stats().await.packages, 0);

        let mut tx = store.begin().await.unwrap();
        package(&mut tx, "kept").await;
        tx.commit().await.unwrap();
        assert_eq!(store.stats().await.packages, 1);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_changes() {
        let store = MemoryPackageStore::new();
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        package(&mut tx, "lost").await;
        assert!(matches!(tx.commit().await, Err(StoreError::Database(_))));
        assert_eq!(store.stats().await.packages, 0);

        let mut tx = store.begin().await.unwrap();
        package(&mut tx, "kept").await;
        tx.commit().await.unwrap();
        assert_eq!(store.stats().await.packages, 1);
    }

    #[tokio::test]
    async fn test_unreferenced_blob_delete() {
        let store = MemoryPackageStore::new();
        let mut tx = store.begin().await.unwrap();
        let (blob, _) = tx
            .get_or_insert_blob(&NewPackageBlob { size: 1, hash_sha256: "def".into() })
            .await
            .unwrap();
        assert_eq!(tx.delete_unreferenced_blob(blob.id).await.unwrap().map(|b| b.id), Some(blob.id));
        assert!(tx.delete_unreferenced_blob(blob.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_insert_or_get() {
        let store = MemoryPackageStore::new();
        let mut tx = store.begin().await.unwrap();
        let new = NewPackageBlob { size: 5, hash_sha256: "abc".into() };
        let (first, exists) = tx.get_or_insert_blob(&new).await.unwrap();
        assert!(!exists);
        let (second, exists) = tx.get_or_insert_blob(&new).await.unwrap();
        assert!(exists);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_file_name_is_unique_per_version() {
        let store = MemoryPackageStore::new();
        let mut tx = store.begin().await.unwrap();
        let package = package(&mut tx, "app").await;
        let (version, _) = tx
            .get_or_insert_version(&NewPackageVersion {
                package_id: package.id,
                creator: "alice".into(),
                version: "v1".into(),
                is_internal: false,
                metadata_json: String::new(),
                download_count: 0,
            })
            .await
            .unwrap();
        let (blob, _) = tx
            .get_or_insert_blob(&NewPackageBlob { size: 1, hash_sha256: "aa".into() })
            .await
            .unwrap();
        let file = NewPackageFile { version_id: version.id, blob_id: blob.id, name: "Layer".into(), is_lead: false };
        tx.insert_file(&file).await.unwrap();
        let again = NewPackageFile { name: "layer".into(), ..file };
        assert!(matches!(tx.insert_file(&again).await, Err(StoreError::Duplicate)));
    }

    #[tokio::test]
    async fn test_upload_update_requires_expected_offset() {
        let store = MemoryPackageStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_blob_upload("u1", "{}").await.unwrap();
        tx.update_blob_upload("u1", 0, 10, "{}").await.unwrap();
        assert!(matches!(
            tx.update_blob_upload("u1", 0, 20, "{}").await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(tx.get_blob_upload("u1").await.unwrap().unwrap().bytes_received, 10);
    }
}
