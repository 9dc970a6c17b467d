// Error types for the chat synchronization core
// Collaborator failures are reported as StoreError and surfaced to callers as SyncError

use thiserror::Error;

/// Errors reported by the external collaborators (remote store, blob store, local storage)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The referenced document, blob or key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A record could not be decoded or encoded
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Errors surfaced to callers of the services and view models
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Rejected before any I/O (empty message, malformed media URL, bad upload)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced chat or message does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or availability failure from the remote store or blob store
    #[error("Remote store error: {0}")]
    TransientRemote(#[source] StoreError),
}

impl SyncError {
    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientRemote(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => SyncError::NotFound(what),
            other => SyncError::TransientRemote(other),
        }
    }
}

/// Failures inside the cache layer.
///
/// These never leave `CacheManager`: they are logged and treated as a cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Cache encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
