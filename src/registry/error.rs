use crate::database::StoreError;

/// Outcome of a registry operation that did not succeed.
///
/// Protocol-level conditions get their own variant. Everything that is an
/// infrastructure failure is kept in one of the last three variants and is
/// never shown to clients in detail.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("blob unknown to registry")]
    BlobUnknown,

    #[error("blob upload unknown to registry")]
    BlobUploadUnknown,

    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("upload offset mismatch: expected {expected}, got {actual}")]
    OffsetMismatch { expected: i64, actual: i64 },

    #[error("provided digest did not match uploaded content: {0}")]
    DigestInvalid(String),

    #[error("blob unknown to registry: {0}")]
    ManifestBlobUnknown(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("manifest exceeds the maximum size of {0} bytes")]
    ManifestTooLarge(usize),

    #[error("manifest unknown")]
    ManifestUnknown,

    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    #[error("repository name not known to registry")]
    NameUnknown,

    #[error("provided length did not match content length: {0}")]
    SizeInvalid(String),

    #[error("the operation is unsupported: {0}")]
    Unsupported(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("requested access to the resource is denied")]
    Denied,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("metadata store failure: {0}")]
    Store(#[from] StoreError),

    #[error("content store failure: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

impl RegistryError {
    /// Whether the error is an infrastructure failure rather than a client
    /// visible registry condition.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            RegistryError::Store(_) | RegistryError::Storage(_) | RegistryError::Io(_)
        )
    }
}
