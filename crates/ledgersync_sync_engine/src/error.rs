//! Error types for the sync engine.

use ledgersync_storage::StorageError;
use ledgersync_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient or permanent transport failure, including timeouts.
    Network,
    /// Credentials were refused; the session must re-authenticate.
    Auth,
    /// A single change was invalid.
    Validation,
    /// The local store failed.
    Storage,
    /// The server sent something undecodable, or a caller misused the API.
    Protocol,
    /// The operation was aborted.
    Cancelled,
}

/// Errors that can occur during sync operations.
///
/// Conflicts are not errors: they are stored as data and surfaced through
/// the conflict list.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A remote call exceeded the request timeout.
    #[error("request timed out")]
    Timeout,

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A single change was rejected as invalid.
    #[error("invalid change for entity '{entity_id}': {message}")]
    Validation {
        /// The offending entity.
        entity_id: String,
        /// What was wrong with it.
        message: String,
    },

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Protocol error (undecodable message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No unresolved conflict has the given ID.
    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    /// The engine was used before `init()`.
    #[error("sync engine not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation error.
    pub fn validation(entity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network { .. } | SyncError::Timeout => ErrorKind::Network,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Validation { .. } => ErrorKind::Validation,
            SyncError::Storage(_) | SyncError::Codec(_) => ErrorKind::Storage,
            SyncError::Protocol(_)
            | SyncError::ConflictNotFound(_)
            | SyncError::NotInitialized => ErrorKind::Protocol,
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidChange { entity_id, reason } => Self::Validation {
                entity_id,
                message: reason,
            },
            other => Self::Protocol(other.to_string()),
        }
    }
}
