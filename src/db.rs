use crate::config::settings::{DatabaseBackend, DatabaseSettings};
use crate::database::{MemoryPackageStore, PackageStore, PostgresPackageStore};
use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub async fn create_pool(settings: &DatabaseSettings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60))
        .max_lifetime(Duration::from_secs(3600))
        .connect_with(settings.connection_string()?.parse()?)
        .await
        .context("Failed to create database connection pool")?;

    // Make sure the pool can actually hand out a connection
    pool.acquire()
        .await
        .context("Failed to acquire initial database connection")?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    Ok(())
}

/// Open the configured metadata store, migrating Postgres first when asked to.
pub async fn open_store(settings: &DatabaseSettings) -> Result<Arc<dyn PackageStore>> {
    match settings.backend {
        DatabaseBackend::Postgres => {
            let pool = create_pool(settings).await?;
            if settings.run_migrations {
                run_migrations(&pool).await?;
            }
            info!(max_connections = settings.max_connections, "Connected to Postgres metadata store");
            Ok(Arc::new(PostgresPackageStore::new(pool)))
        }
        DatabaseBackend::Memory => {
            info!("Using in-memory metadata store; data is lost on exit");
            Ok(Arc::new(MemoryPackageStore::new()))
        }
    }
}
