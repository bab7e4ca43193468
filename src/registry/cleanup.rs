//! Reclaiming abandoned uploads.
//!
//! Every sweep works on an "older than" threshold so that a push in flight at
//! the moment of the sweep keeps its data.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::uploader::BlobUploader;
use super::{Registry, RegistryResult, UPLOAD_VERSION};
use crate::database::{self, PropertyType};

/// What one cleanup run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub uploads: usize,
    pub files: usize,
    pub versions: usize,
    pub blobs: usize,
    pub packages: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.uploads + self.files + self.versions + self.blobs + self.packages
    }

    fn record_metrics(&self) {
        for (kind, count) in [
            ("uploads", self.uploads),
            ("files", self.files),
            ("versions", self.versions),
            ("blobs", self.blobs),
            ("packages", self.packages),
        ] {
            if count > 0 {
                metrics::counter!("registry_cleanup_removed_total", "kind" => kind)
                    .increment(count as u64);
            }
        }
    }
}

impl Registry {
    /// Run every sweep against data created before `older_than`.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> RegistryResult<CleanupReport> {
        let mut report = CleanupReport {
            uploads: self.remove_expired_uploads(older_than).await?,
            ..Default::default()
        };
        (report.files, report.versions) = self.remove_expired_upload_files(older_than).await?;
        report.blobs = self.remove_unreferenced_blobs(older_than).await?;
        report.packages = self.remove_empty_packages().await?;

        report.record_metrics();
        if report.total() > 0 {
            info!(?report, "Cleanup removed stale data");
        }
        Ok(report)
    }

    /// Cleanup with a threshold of `retention` before now.
    pub async fn run_cleanup(&self, retention: Duration) -> RegistryResult<CleanupReport> {
        self.cleanup(Utc::now() - retention).await
    }

    /// Upload sessions created before the threshold, completed or not.
    async fn remove_expired_uploads(&self, older_than: DateTime<Utc>) -> RegistryResult<usize> {
        let expired = {
            let mut tx = self.store.begin().await?;
            tx.find_expired_blob_uploads(older_than).await?
        };
        for upload in &expired {
            BlobUploader::remove(self.store.as_ref(), &self.options.upload_dir, &upload.id).await?;
        }
        Ok(expired.len())
    }

    /// Files still parked in upload versions, then the upload versions left
    /// without any file.
    async fn remove_expired_upload_files(
        &self,
        older_than: DateTime<Utc>,
    ) -> RegistryResult<(usize, usize)> {
        let mut tx = self.store.begin().await?;

        let files = tx.find_expired_internal_files(UPLOAD_VERSION, older_than).await?;
        for file in &files {
            database::delete_file(tx.as_mut(), file).await?;
        }

        let versions = tx.find_empty_internal_versions(UPLOAD_VERSION).await?;
        for version in &versions {
            tx.delete_properties(PropertyType::Version, version.id).await?;
            tx.delete_version(version.id).await?;
        }

        tx.commit().await?;
        Ok((files.len(), versions.len()))
    }

    /// Blobs no file refers to any more. Each candidate is rechecked under
    /// its row lock in its own transaction, and the content is removed
    /// while that lock is held so a concurrent push of the same hash waits
    /// for the commit and then writes the bytes again.
    async fn remove_unreferenced_blobs(&self, older_than: DateTime<Utc>) -> RegistryResult<usize> {
        let candidates = {
            let mut tx = self.store.begin().await?;
            tx.find_unreferenced_blobs(older_than).await?
        };

        let mut removed = 0;
        for candidate in &candidates {
            let mut tx = self.store.begin().await?;
            let Some(blob) = tx.delete_unreferenced_blob(candidate.id).await? else {
                debug!(blob_id = candidate.id, "Blob gained a reference, keeping it");
                continue;
            };
            self.storage.delete_blob(&blob.hash_sha256).await?;
            tx.commit().await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn remove_empty_packages(&self) -> RegistryResult<usize> {
        let mut tx = self.store.begin().await?;
        let packages = tx.find_packages_without_versions().await?;
        for package in &packages {
            tx.delete_properties(PropertyType::Package, package.id).await?;
            tx.delete_package(package.id).await?;
        }
        tx.commit().await?;
        Ok(packages.len())
    }
}

/// Run cleanup every `interval` until the runtime shuts down. The first run
/// happens one interval after start.
pub fn spawn_cleanup_task(
    registry: Registry,
    interval: StdDuration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = registry.run_cleanup(retention).await {
                error!(error = %err, "Registry cleanup failed");
            }
        }
    })
}
