pub mod settings;

pub use settings::{
    AuthSettings, DatabaseBackend, DatabaseSettings, RegistrySettings, S3Settings, ServerSettings, Settings,
    StorageBackend, StorageSettings,
};
