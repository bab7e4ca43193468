use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::models::*;
use super::{PackageStore, PackageTx, StoreError, StoreResult};
use crate::registry::{PROPERTY_REPOSITORY, PROPERTY_DIGEST, PROPERTY_IMAGE_TAGGED, MANIFEST_FILENAME};

const PACKAGE_COLUMNS: &str = "id, owner, name, lower_name, created_at";
const VERSION_COLUMNS: &str = "id, package_id, creator, version, lower_version, is_internal, metadata_json, download_count, created_at";
const BLOB_COLUMNS: &str = "id, size, hash_sha256, created_at";
const FILE_COLUMNS: &str = "id, version_id, blob_id, name, lower_name, is_lead, created_at";
const UPLOAD_COLUMNS: &str = "id, bytes_received, hash_state, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresPackageStore {
    pool: PgPool,
}

impl PostgresPackageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PackageStore for PostgresPackageStore {
    async fn begin(&self) -> StoreResult<Box<dyn PackageTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresPackageTx { tx }))
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub struct PostgresPackageTx {
    tx: Transaction<'static, Postgres>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl PackageTx for PostgresPackageTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn lock_package(&mut self, owner: &str, lower_name: &str) -> StoreResult<()> {
        let key = format!("package:{}/{}", owner, lower_name);
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_or_insert_package(&mut self, package: &NewPackage) -> StoreResult<(Package, bool)> {
        let lower_name = package.name.to_lowercase();
        let inserted = sqlx::query_as::<_, Package>(&format!(
            "INSERT INTO packages (owner, name, lower_name)
             VALUES ($1, $2, $3)
             ON CONFLICT (owner, lower_name) DO NOTHING
             RETURNING {PACKAGE_COLUMNS}"
        ))
        .bind(&package.owner)
        .bind(&package.name)
        .bind(&lower_name)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = inserted {
            debug!(package_id = row.id, "Created package {}/{}", row.owner, row.lower_name);
            return Ok((row, true));
        }

        let existing = self
            .get_package_by_name(&package.owner, &lower_name)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok((existing, false))
    }

    async fn get_package_by_name(&mut self, owner: &str, lower_name: &str) -> StoreResult<Option<Package>> {
        let row = sqlx::query_as::<_, Package>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages WHERE owner = $1 AND lower_name = $2"
        ))
        .bind(owner)
        .bind(lower_name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn delete_package(&mut self, package_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM packages WHERE id = $1")
            .bind(package_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_packages_without_versions(&mut self) -> StoreResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, Package>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM packages p
             WHERE NOT EXISTS (SELECT 1 FROM package_versions pv WHERE pv.package_id = p.id)
             ORDER BY p.id"
        ))
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn search_repositories(&mut self, last: &str, limit: i64) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"SELECT pp.value FROM package_properties pp
               JOIN packages p ON p.id = pp.ref_id
               WHERE pp.ref_type = $1 AND pp.name = $2
                 AND pp.value COLLATE "C" > $3 COLLATE "C"
                 AND EXISTS (
                     SELECT 1 FROM package_versions pv
                     WHERE pv.package_id = p.id AND NOT pv.is_internal
                 )
               ORDER BY pp.value COLLATE "C"
               LIMIT $4"#,
        )
        .bind(PropertyType::Package)
        .bind(PROPERTY_REPOSITORY)
        .bind(last)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn get_or_insert_version(&mut self, version: &NewPackageVersion) -> StoreResult<(PackageVersion, bool)> {
        let lower_version = version.version.to_lowercase();
        let inserted = sqlx::query_as::<_, PackageVersion>(&format!(
            "INSERT INTO package_versions
                (package_id, creator, version, lower_version, is_internal, metadata_json, download_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (package_id, lower_version) DO NOTHING
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(version.package_id)
        .bind(&version.creator)
        .bind(&version.version)
        .bind(&lower_version)
        .bind(version.is_internal)
        .bind(&version.metadata_json)
        .bind(version.download_count)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        let existing = self
            .get_version_by_name(version.package_id, &lower_version)
            .await?
            .ok_or(StoreError::NotFound)?;
        Ok((existing, false))
    }

    async fn get_version_by_id(&mut self, version_id: i64) -> StoreResult<Option<PackageVersion>> {
        let row = sqlx::query_as::<_, PackageVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM package_versions WHERE id = $1"
        ))
        .bind(version_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn get_version_by_name(&mut self, package_id: i64, lower_version: &str) -> StoreResult<Option<PackageVersion>> {
        let row = sqlx::query_as::<_, PackageVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM package_versions WHERE package_id = $1 AND lower_version = $2"
        ))
        .bind(package_id)
        .bind(lower_version)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn delete_version(&mut self, version_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM package_versions WHERE id = $1")
            .bind(version_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_download_count(&mut self, version_id: i64) -> StoreResult<()> {
        let result = sqlx::query("UPDATE package_versions SET download_count = download_count + 1 WHERE id = $1")
            .bind(version_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn count_owner_versions(&mut self, owner: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM package_versions pv
             JOIN packages p ON p.id = pv.package_id
             WHERE p.owner = $1 AND NOT pv.is_internal",
        )
        .bind(owner)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn find_empty_internal_versions(&mut self, lower_version: &str) -> StoreResult<Vec<PackageVersion>> {
        let rows = sqlx::query_as::<_, PackageVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM package_versions pv
             WHERE pv.is_internal AND pv.lower_version = $1
               AND NOT EXISTS (SELECT 1 FROM package_files pf WHERE pf.version_id = pv.id)
             ORDER BY pv.id"
        ))
        .bind(lower_version)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn search_image_tags(&mut self, package_id: i64, last: &str, limit: Option<i64>) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"SELECT pv.version FROM package_versions pv
               WHERE pv.package_id = $1 AND NOT pv.is_internal
                 AND pv.lower_version COLLATE "C" > $2 COLLATE "C"
                 AND EXISTS (
                     SELECT 1 FROM package_properties pp
                     WHERE pp.ref_type = $3 AND pp.ref_id = pv.id AND pp.name = $4
                 )
               ORDER BY pv.lower_version COLLATE "C"
               LIMIT $5"#,
        )
        .bind(package_id)
        .bind(last.to_lowercase())
        .bind(PropertyType::Version)
        .bind(PROPERTY_IMAGE_TAGGED)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn get_or_insert_blob(&mut self, blob: &NewPackageBlob) -> StoreResult<(PackageBlob, bool)> {
        let inserted = sqlx::query_as::<_, PackageBlob>(&format!(
            "INSERT INTO package_blobs (size, hash_sha256)
             VALUES ($1, $2)
             ON CONFLICT (hash_sha256) DO NOTHING
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(blob.size)
        .bind(&blob.hash_sha256)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, false));
        }

        // The key share lock keeps cleanup from removing the row before the
        // caller's file insert commits.
        let existing = sqlx::query_as::<_, PackageBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM package_blobs WHERE hash_sha256 = $1 FOR KEY SHARE"
        ))
        .bind(&blob.hash_sha256)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok((existing, true))
    }

    async fn get_blob_by_id(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>> {
        let row = sqlx::query_as::<_, PackageBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM package_blobs WHERE id = $1"
        ))
        .bind(blob_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn delete_unreferenced_blob(&mut self, blob_id: i64) -> StoreResult<Option<PackageBlob>> {
        // Waits for pushes holding the row through a file insert or dedup lookup
        let locked = sqlx::query_scalar::<_, i64>("SELECT id FROM package_blobs WHERE id = $1 FOR UPDATE")
            .bind(blob_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        if locked.is_none() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, PackageBlob>(&format!(
            "DELETE FROM package_blobs pb
             WHERE pb.id = $1
               AND NOT EXISTS (SELECT 1 FROM package_files pf WHERE pf.blob_id = pb.id)
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(blob_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_unreferenced_blobs(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageBlob>> {
        let rows = sqlx::query_as::<_, PackageBlob>(&format!(
            "SELECT {BLOB_COLUMNS} FROM package_blobs pb
             WHERE pb.created_at < $1
               AND NOT EXISTS (SELECT 1 FROM package_files pf WHERE pf.blob_id = pb.id)
             ORDER BY pb.id"
        ))
        .bind(older_than)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn insert_file(&mut self, file: &NewPackageFile) -> StoreResult<PackageFile> {
        let result = sqlx::query_as::<_, PackageFile>(&format!(
            "INSERT INTO package_files (version_id, blob_id, name, lower_name, is_lead)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (version_id, lower_name) DO NOTHING
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(file.version_id)
        .bind(file.blob_id)
        .bind(&file.name)
        .bind(file.name.to_lowercase())
        .bind(file.is_lead)
        .fetch_optional(&mut *self.tx)
        .await;

        match result {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(StoreError::Duplicate),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_file_by_name(&mut self, version_id: i64, lower_name: &str) -> StoreResult<Option<PackageFile>> {
        let row = sqlx::query_as::<_, PackageFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM package_files WHERE version_id = $1 AND lower_name = $2"
        ))
        .bind(version_id)
        .bind(lower_name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn get_files_by_version(&mut self, version_id: i64) -> StoreResult<Vec<PackageFile>> {
        let rows = sqlx::query_as::<_, PackageFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM package_files WHERE version_id = $1 ORDER BY id"
        ))
        .bind(version_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete_file(&mut self, file_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM package_files WHERE id = $1")
            .bind(file_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn sum_owner_file_size(&mut self, owner: &str) -> StoreResult<i64> {
        let total = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT SUM(pb.size)::BIGINT FROM package_files pf
             JOIN package_blobs pb ON pb.id = pf.blob_id
             JOIN package_versions pv ON pv.id = pf.version_id
             JOIN packages p ON p.id = pv.package_id
             WHERE p.owner = $1",
        )
        .bind(owner)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(total.unwrap_or(0))
    }

    async fn find_expired_internal_files(&mut self, lower_version: &str, older_than: DateTime<Utc>) -> StoreResult<Vec<PackageFile>> {
        let rows = sqlx::query_as::<_, PackageFile>(
            "SELECT pf.id, pf.version_id, pf.blob_id, pf.name, pf.lower_name, pf.is_lead, pf.created_at
             FROM package_files pf
             JOIN package_versions pv ON pv.id = pf.version_id
             WHERE pv.is_internal AND pv.lower_version = $1 AND pf.created_at < $2
             ORDER BY pf.id",
        )
        .bind(lower_version)
        .bind(older_than)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn search_files(&mut self, opts: &FileSearchOptions, limit: Option<i64>) -> StoreResult<Vec<PackageFile>> {
        let rows = sqlx::query_as::<_, PackageFile>(
            "SELECT pf.id, pf.version_id, pf.blob_id, pf.name, pf.lower_name, pf.is_lead, pf.created_at
             FROM package_files pf
             JOIN package_versions pv ON pv.id = pf.version_id
             JOIN packages p ON p.id = pv.package_id
             WHERE ($1::TEXT IS NULL OR p.owner = $1)
               AND ($2::TEXT IS NULL OR p.lower_name = $2)
               AND ($3::TEXT IS NULL OR (pv.lower_version = $3 AND NOT pv.is_internal))
               AND ($4::TEXT IS NULL OR EXISTS (
                   SELECT 1 FROM package_properties pp
                   WHERE pp.ref_type = $7 AND pp.ref_id = pf.id AND pp.name = $8 AND pp.value = $4
               ))
               AND ($5::TEXT IS NULL OR EXISTS (
                   SELECT 1 FROM package_properties pp
                   WHERE pp.ref_type = $9 AND pp.ref_id = p.id AND pp.name = $10 AND pp.value = $5
               ))
               AND (NOT $6 OR pf.lower_name = $11)
             ORDER BY pf.id
             LIMIT $12",
        )
        .bind(opts.owner.as_deref())
        .bind(opts.image.as_deref())
        .bind(opts.tag.as_deref())
        .bind(opts.digest.as_deref())
        .bind(opts.repository.as_deref())
        .bind(opts.is_manifest)
        .bind(PropertyType::File)
        .bind(PROPERTY_DIGEST)
        .bind(PropertyType::Package)
        .bind(PROPERTY_REPOSITORY)
        .bind(MANIFEST_FILENAME)
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn insert_property(&mut self, ref_type: PropertyType, ref_id: i64, name: &str, value: &str) -> StoreResult<PackageProperty> {
        let row = sqlx::query_as::<_, PackageProperty>(
            "INSERT INTO package_properties (ref_type, ref_id, name, value)
             VALUES ($1, $2, $3, $4)
             RETURNING id, ref_type, ref_id, name, value",
        )
        .bind(ref_type)
        .bind(ref_id)
        .bind(name)
        .bind(value)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn get_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<Vec<PackageProperty>> {
        let rows = sqlx::query_as::<_, PackageProperty>(
            "SELECT id, ref_type, ref_id, name, value FROM package_properties
             WHERE ref_type = $1 AND ref_id = $2 ORDER BY id",
        )
        .bind(ref_type)
        .bind(ref_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete_properties(&mut self, ref_type: PropertyType, ref_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM package_properties WHERE ref_type = $1 AND ref_id = $2")
            .bind(ref_type)
            .bind(ref_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn create_blob_upload(&mut self, id: &str, hash_state: &str) -> StoreResult<BlobUpload> {
        let row = sqlx::query_as::<_, BlobUpload>(&format!(
            "INSERT INTO blob_uploads (id, bytes_received, hash_state)
             VALUES ($1, 0, $2)
             RETURNING {UPLOAD_COLUMNS}"
        ))
        .bind(id)
        .bind(hash_state)
        .fetch_one(&mut *self.tx)
        .await;

        match row {
            Ok(row) => Ok(row),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Duplicate),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_blob_upload(&mut self, id: &str) -> StoreResult<Option<BlobUpload>> {
        let row = sqlx::query_as::<_, BlobUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM blob_uploads WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn update_blob_upload(&mut self, id: &str, expected_bytes_received: i64, bytes_received: i64, hash_state: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE blob_uploads
             SET bytes_received = $3, hash_state = $4, updated_at = NOW()
             WHERE id = $1 AND bytes_received = $2",
        )
        .bind(id)
        .bind(expected_bytes_received)
        .bind(bytes_received)
        .bind(hash_state)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_blob_upload(&mut self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM blob_uploads WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn find_expired_blob_uploads(&mut self, older_than: DateTime<Utc>) -> StoreResult<Vec<BlobUpload>> {
        let rows = sqlx::query_as::<_, BlobUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM blob_uploads WHERE created_at < $1 ORDER BY created_at"
        ))
        .bind(older_than)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }
}
