//! Package metadata persistence.
//!
//! The registry core talks to the metadata store only through [`PackageStore`]
//! and the transactions it hands out. Every read and write happens inside a
//! [`PackageTx`]; dropping a transaction without calling
//! [`PackageTx::commit`] rolls it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod memory;
pub mod models;
pub mod queries;

pub use memory::MemoryPackageStore;
pub use models::*;
pub use queries::PostgresPackageStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,
    #[error("Record already exists")]
    Duplicate,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PackageStore: Send + Sync + 'static {
    /// Start a new transaction.
    async fn begin(&self) -> StoreResult<Box<dyn PackageTx>>;

    async fn health_check(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait PackageTx: Send {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Serialize writers of one package until this transaction ends.
    async fn lock_package(&mut self, owner: &str, lower_name: &str) -> StoreResult<()>;

    // Packages

    /// Insert the package or return the existing row. The flag is true when
    /// the row was created by this call.
    async fn get_or_insert_package(&mut self, package: &NewPackage) -> StoreResult<(Package, bool)>;
    async fn get_package_by_name(&mut self, owner: &str, lower_name: &str) -> StoreResult<Option<Package>>;
    async fn delete_package(&mut self, package_id: i64) -> StoreResult<()>;
    async fn find_packages_without_versions(&mut self) -> StoreResult<Vec<Package>>;
    /// Canonical repository names, ascending, strictly after `last`.
    async fn search_repositories(&mut self, last: &str, limit: i64) -> StoreResult<Vec<String>>;

    // Versions

    /// Insert the version or return the existing row for the same reference.
    /// The flag is true when the row was created by this call.
    async fn get_or_insert_version(&mut self, version: &NewPackageVersion) -> StoreResult<(PackageVersion, bool)>;
    async fn get_version_by_id(&mut self, version_id: i64) -> StoreResult<Option<PackageVersion>>;
    async fn get_version_by_name(&mut self, package_id: i64, lower_version: &str) -> StoreResult<Option<PackageVersion>>;
    async fn delete_version(&mut self, version_id: i64) -> StoreResult<()>;
    async fn increment_download_count(&mut self, version_id: i64) -> StoreResult<()>;
    async fn count_owner_versions(&mut self, owner: &str) -> StoreResult<i64>;
    /// Internal versions with the given name that have no files left.
    async fn find_empty_internal_versions(&mut self, lower_version: &str) -> StoreResult<Vec<PackageVersion>>;
    /// Non-internal tagged versions of a package, ascending, strictly after `last`.
    async fn search_image_tags(&mut self, package_id: i64, last: &str, limit: Option<i64>) -> StoreResult<Vec<String>>;

    // Blobs

    /// Insert the blob or return the existing row for the same hash. The flag
    /// is true when the hash was already known.
    async fn get_or_insert_blob(&mut self, blob: &NewPackageBlob) -> StoreResult<(PackageBlob, bool)>;
    async fn get_blob_by_id(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>>;
    /// Lock the blob row and delete it only if no file refers to it. Returns
    /// the deleted row; the lock is held until the transaction ends.
    async fn delete_unreferenced_blob(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>>;
    async fn find_unreferenced_blobs(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageBlob>>;

    // Files

    /// Fails with [`StoreError::Duplicate`] when the version already has a
    /// file with the same lowercase name.
    async fn insert_file(&mut self, file: &NewPackageFile) -> StoreResult<PackageFile>;
    async fn get_file_by_name(&mut self, version_id: i64, lower_name: &str) -> StoreResult<Option<PackageFile>>;
    async fn get_files_by_version(&mut self, version_id: i64) -> StoreResult<Vec<PackageFile>>;
    async fn delete_file(&mut self, file_id: i64) -> StoreResult<()>;
    async fn sum_owner_file_size(&mut self, owner: &str) -> StoreResult<i64>;
    /// Files of internal versions with the given name created before `older_than`.
    async fn find_expired_internal_files(&mut self, lower_version: &str, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageFile>>;
    /// Files matching the container filters, ordered by file id.
    async fn search_files(&mut self, opts: &FileSearchOptions, limit: Option<i64>) -> StoreResult<Vec<PackageFile>>;

    // Properties

    async fn insert_property(&mut self, ref_type: PropertyType, ref_id: i64, name: &str, value: &str) -> StoreResult<PackageProperty>;
    async fn get_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<Vec<PackageProperty>>;
    async fn delete_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<()>;

    // Upload sessions

    async fn create_blob_upload(&mut self, id: &str, hash_state: &str) -> StoreResult<BlobUpload>;
    async fn get_blob_upload(&mut self, id: &str) -> StoreResult<Option<BlobUpload>>;
    /// Persist a new offset and hash state. Fails with [`StoreError::NotFound`]
    /// when the stored offset is no longer `expected_bytes_received`.
    async fn update_blob_upload(&mut self, id: &str, expected_bytes_received: i64, bytes_received: i64, hash_state: &str) -> StoreResult<()>;
    async fn delete_blob_upload(&mut self, id: &str) -> StoreResult<()>;
    async fn find_expired_blob_uploads(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<BlobUpload>>;
}

/// Delete a file together with its properties.
pub async fn delete_file(tx: &mut dyn PackageTx, file: &PackageFile) -> StoreResult<()> {
    tx.delete_properties(PropertyType::File, file.id).await?;
    tx.delete_file(file.id).await
}

/// Delete a version, its properties and every file attached to it.
/// Blobs are left in place; unreferenced ones are reclaimed by cleanup.
pub async fn delete_version_and_references(tx: &mut dyn PackageTx, version: &PackageVersion) -> StoreResult<()> {
    tx.delete_properties(PropertyType::Version, version.id).await?;
    for file in tx.get_files_by_version(version.id).await? {
        delete_file(tx, &file).await?;
    }
    tx.delete_version(version.id).await
}
