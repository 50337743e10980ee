//! Storage error types.

use thiserror::Error;

/// Storage errors - every failure a backend can surface to its caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Missing backend, invalid URI or key prefix, client construction failure.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown storage scheme: {0}")]
    UnknownScheme(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// A single store operation failed. Nothing is retried.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Configuration failures are permanent; retrying them cannot succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::UnknownScheme(_))
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
