//! Error types for herdstore

use std::io;
use thiserror::Error;

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types for backend operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error talking to the store
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Store could not be reached or refused the connection
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Malformed or unexpected reply
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Script failed or is not supported by this backend
    #[error("Script error: {0}")]
    Script(String),

    /// Caller passed arguments a script cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether the failure is transient (connection level) rather than a
    /// problem with the request itself
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Unavailable(_))
    }
}
