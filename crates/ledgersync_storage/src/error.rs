//! Error types for storage operations.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Cloneable so a failed sync cycle can hand the same error to every caller
/// waiting on it.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The commit log is corrupted beyond the recoverable tail.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A batch could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Another process holds the commit log open.
    #[error("commit log is locked by another process: {0}")]
    Locked(String),

    /// The backend refused the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl StorageError {
    /// Creates a codec error from any displayable cause.
    pub fn codec(cause: impl std::fmt::Display) -> Self {
        Self::Codec(cause.to_string())
    }
}
