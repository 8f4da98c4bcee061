//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A manifest names a written object that was never staged.
    #[error("object {key} is in the manifest but was not staged")]
    NotStaged {
        /// The object key.
        key: String,
    },

    /// The storage is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}

impl StorageError {
    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
