use anyhow::{anyhow, bail, Context, Result};
use secrecy::{ExposeSecret, Secret};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;
use validator::Validate;

use crate::registry::{QuotaLimits, RegistryOptions};
use crate::storage::S3Config;

pub const DEFAULT_MAX_MANIFEST_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Validate)]
pub struct Settings {
    #[validate]
    pub server: ServerSettings,
    #[validate]
    pub database: DatabaseSettings,
    #[validate]
    pub storage: StorageSettings,
    #[validate]
    pub auth: AuthSettings,
    #[validate]
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, Validate)]
pub struct ServerSettings {
    #[validate(custom = "validate_socket_addr")]
    pub listen_address: String,
    /// Public base URL, used to build the token realm
    #[validate(custom = "validate_url")]
    pub app_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

impl FromStr for DatabaseBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown database backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Validate)]
pub struct DatabaseSettings {
    pub backend: DatabaseBackend,
    pub url: Option<Secret<String>>,
    #[validate(range(min = 1))]
    pub max_connections: u32,
    pub min_connections: u32,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Filesystem,
    S3,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "filesystem" | "fs" | "local" => Ok(Self::Filesystem),
            "s3" => Ok(Self::S3),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown storage backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Validate)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root of the filesystem backend
    pub path: PathBuf,
    #[validate]
    pub s3: Option<S3Settings>,
    /// Scratch directory for upload sessions
    pub chunked_upload_path: PathBuf,
}

#[derive(Debug, Clone, Validate)]
pub struct S3Settings {
    #[validate(custom = "validate_url")]
    pub endpoint: String,
    #[validate(length(min = 1))]
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    pub use_path_style: bool,
}

#[derive(Debug, Clone, Validate)]
pub struct AuthSettings {
    pub jwt_secret: Secret<String>,
    pub allow_anonymous_pull: bool,
    #[validate(range(min = 60))]
    pub token_ttl_seconds: u64,
}

#[derive(Debug, Clone, Validate)]
pub struct RegistrySettings {
    #[validate(range(min = 1))]
    pub max_manifest_size: usize,
    #[validate(range(min = -1))]
    pub limit_total_owner_count: i64,
    #[validate(range(min = -1))]
    pub limit_total_owner_size: i64,
    #[validate(range(min = -1))]
    pub limit_size_container: i64,
    pub cleanup_retention_seconds: u64,
    /// `0` turns the background sweeper off
    pub cleanup_interval_seconds: u64,
}

/// Reads one variable, `None` when unset.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn var(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn required(lookup: Lookup<'_>, key: &str) -> Result<String> {
    var(lookup, key).with_context(|| format!("{key} environment variable is required"))
}

fn parse_or<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var(lookup, key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for {key}: {err}")),
        None => Ok(default),
    }
}

impl Settings {
    /// Load configuration from the process environment, after reading a
    /// `.env` file if one exists.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(&|key: &str| env::var(key).ok())
    }

    /// Build settings from any variable source and validate them.
    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let settings = Settings {
            server: ServerSettings::from_env(lookup)?,
            database: DatabaseSettings::from_env(lookup)?,
            storage: StorageSettings::from_env(lookup)?,
            auth: AuthSettings::from_env(lookup)?,
            registry: RegistrySettings::from_env(lookup)?,
        };

        settings
            .validate_all()
            .context("Configuration validation failed")?;

        Ok(settings)
    }

    pub fn validate_all(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        self.server.validate()?;
        self.database.validate()?;
        self.storage.validate()?;
        self.auth.validate()?;
        self.registry.validate()?;
        Ok(())
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            upload_dir: self.storage.chunked_upload_path.clone(),
            max_manifest_size: self.registry.max_manifest_size,
            limits: QuotaLimits {
                total_owner_count: self.registry.limit_total_owner_count,
                total_owner_size: self.registry.limit_total_owner_size,
                size_container: self.registry.limit_size_container,
            },
        }
    }
}

impl ServerSettings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        let listen_address = var(lookup, "LISTEN_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let app_url = var(lookup, "APP_URL").unwrap_or_else(|| format!("http://{listen_address}"));
        Ok(ServerSettings {
            listen_address,
            app_url: app_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .context("Invalid LISTEN_ADDRESS format. Expected format: 'host:port'")
    }

    /// Realm advertised in `WWW-Authenticate` challenges.
    pub fn token_realm(&self) -> String {
        format!("{}/v2/token", self.app_url)
    }
}

impl DatabaseSettings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        let backend = parse_or(lookup, "DATABASE_BACKEND", DatabaseBackend::Postgres)?;
        let url = var(lookup, "DATABASE_URL").map(Secret::new);
        if backend == DatabaseBackend::Postgres {
            let url = url
                .as_ref()
                .context("DATABASE_URL environment variable is required")?;
            Url::parse(url.expose_secret()).context("Invalid DATABASE_URL format")?;
        }

        let settings = DatabaseSettings {
            backend,
            url,
            max_connections: parse_or(lookup, "DATABASE_MAX_CONNECTIONS", 20)?,
            min_connections: parse_or(lookup, "DATABASE_MIN_CONNECTIONS", 5)?,
            run_migrations: parse_or(lookup, "DATABASE_RUN_MIGRATIONS", true)?,
        };
        if settings.min_connections > settings.max_connections {
            bail!("DATABASE_MIN_CONNECTIONS must not exceed DATABASE_MAX_CONNECTIONS");
        }
        Ok(settings)
    }

    pub fn connection_string(&self) -> Result<&str> {
        self.url
            .as_ref()
            .map(|url| url.expose_secret().as_str())
            .context("DATABASE_URL is not configured")
    }
}

impl StorageSettings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        let backend = parse_or(lookup, "STORAGE_BACKEND", StorageBackend::Filesystem)?;
        let s3 = match backend {
            StorageBackend::S3 => Some(S3Settings::from_env(lookup)?),
            _ => None,
        };
        let path: PathBuf = parse_or(lookup, "STORAGE_PATH", PathBuf::from("./data/blobs"))?;
        let chunked_upload_path = parse_or(lookup, "CHUNKED_UPLOAD_PATH", env::temp_dir().join("container-registry-uploads"))?;
        Ok(StorageSettings {
            backend,
            path,
            s3,
            chunked_upload_path,
        })
    }
}

impl S3Settings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        Ok(S3Settings {
            endpoint: required(lookup, "S3_ENDPOINT")?,
            bucket: required(lookup, "S3_BUCKET")?,
            region: var(lookup, "S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: required(lookup, "S3_ACCESS_KEY_ID")?,
            secret_access_key: Secret::new(required(lookup, "S3_SECRET_ACCESS_KEY")?),
            use_path_style: parse_or(lookup, "S3_USE_PATH_STYLE", true)?,
        })
    }

    pub fn to_config(&self) -> S3Config {
        S3Config {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            bucket: self.bucket.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            use_path_style: self.use_path_style,
        }
    }
}

impl AuthSettings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        Ok(AuthSettings {
            jwt_secret: Secret::new(required(lookup, "JWT_SECRET")?),
            allow_anonymous_pull: parse_or(lookup, "ALLOW_ANONYMOUS_PULL", true)?,
            token_ttl_seconds: parse_or(lookup, "TOKEN_TTL_SECONDS", 3600)?,
        })
    }
}

impl RegistrySettings {
    fn from_env(lookup: Lookup<'_>) -> Result<Self> {
        Ok(RegistrySettings {
            max_manifest_size: parse_or(lookup, "MAX_MANIFEST_SIZE", DEFAULT_MAX_MANIFEST_SIZE)?,
            limit_total_owner_count: parse_or(lookup, "LIMIT_TOTAL_OWNER_COUNT", -1)?,
            limit_total_owner_size: parse_or(lookup, "LIMIT_TOTAL_OWNER_SIZE", -1)?,
            limit_size_container: parse_or(lookup, "LIMIT_SIZE_CONTAINER", -1)?,
            cleanup_retention_seconds: parse_or(lookup, "CLEANUP_RETENTION_SECONDS", 24 * 60 * 60)?,
            cleanup_interval_seconds: parse_or(lookup, "CLEANUP_INTERVAL_SECONDS", 60 * 60)?,
        })
    }
}

fn validate_socket_addr(addr: &str) -> Result<(), validator::ValidationError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| validator::ValidationError::new("invalid_socket_address"))
}

fn validate_url(url: &str) -> Result<(), validator::ValidationError> {
    Url::parse(url)
        .map(|_| ())
        .map_err(|_| validator::ValidationError::new("invalid_url"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(&|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_with_memory_backends() {
        let settings = load(&[
            ("DATABASE_BACKEND", "memory"),
            ("STORAGE_BACKEND", "memory"),
            ("JWT_SECRET", "secret"),
        ])
        .unwrap();

        assert_eq!(settings.server.listen_address, "0.0.0.0:8080");
        assert_eq!(settings.server.token_realm(), "http://0.0.0.0:8080/v2/token");
        assert_eq!(settings.database.backend, DatabaseBackend::Memory);
        assert!(settings.auth.allow_anonymous_pull);
        assert_eq!(settings.registry.max_manifest_size, DEFAULT_MAX_MANIFEST_SIZE);
        assert_eq!(settings.registry_options().limits, QuotaLimits::default());
        assert_eq!(settings.registry.cleanup_retention_seconds, 86_400);
    }

    #[test]
    fn test_postgres_requires_database_url() {
        let err = load(&[("JWT_SECRET", "secret")]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_s3_settings_are_required_for_s3_backend() {
        let err = load(&[
            ("DATABASE_BACKEND", "memory"),
            ("STORAGE_BACKEND", "s3"),
            ("JWT_SECRET", "secret"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("S3_ENDPOINT"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let base = [("DATABASE_BACKEND", "memory"), ("JWT_SECRET", "secret")];

        let mut vars = base.to_vec();
        vars.push(("LIMIT_SIZE_CONTAINER", "lots"));
        assert!(load(&vars).is_err());

        let mut vars = base.to_vec();
        vars.push(("LIMIT_SIZE_CONTAINER", "-5"));
        assert!(load(&vars).is_err());

        let mut vars = base.to_vec();
        vars.push(("LISTEN_ADDRESS", "not-an-address"));
        assert!(load(&vars).is_err());
    }
}
