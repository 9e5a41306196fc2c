//! Error types for herdcache

use herdstore::StoreError;
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by a caller's compute or mutate callback
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error types surfaced to callers of the cache
#[derive(Debug, Error)]
pub enum Error {
    /// Lock not acquired in time; retry or shed load
    #[error("Busy: {0}")]
    Busy(String),

    /// Admission confirmed the value does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend could not be reached
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[source] StoreError),

    /// Lease is held by another party
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unexpected state; the current call cannot continue
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cached payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller's callback failed
    #[error("Compute failed: {0}")]
    Compute(#[source] BoxError),
}

impl Error {
    /// Wrap a callback failure
    pub fn compute(err: impl Into<BoxError>) -> Self {
        Error::Compute(err.into())
    }

    /// HTTP-style status code for a higher layer
    pub fn status(&self) -> u16 {
        match self {
            Error::Busy(_) | Error::Conflict(_) => 409,
            Error::NotFound(_) => 404,
            Error::BackendUnavailable(_) => 503,
            Error::Internal(_) | Error::Config(_) | Error::Serialization(_) | Error::Compute(_) => 500,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            Error::BackendUnavailable(err)
        } else {
            Error::Internal(err.to_string())
        }
    }
}
