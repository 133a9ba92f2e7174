//! Common error types for tether.

use thiserror::Error;

/// Top-level error type for offline sync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The request never reached the server (no connectivity, socket failure).
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-conflict error.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// An attachment upload was definitively refused.
    #[error("Upload rejected: {0}")]
    Upload(String),

    /// A conditional write failed and was not resolved into a retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A bounded wait elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure happened before any server response.
    ///
    /// Transient failures pause the mutation queue instead of discarding work.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
