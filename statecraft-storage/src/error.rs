//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

impl StorageError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "IO_ERROR",
            StorageError::Json(_) => "JSON_ERROR",
            StorageError::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            StorageError::Corruption(_) => "CORRUPTION",
        }
    }
}
