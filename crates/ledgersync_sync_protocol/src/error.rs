//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while validating or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A change or delta is structurally invalid.
    #[error("invalid change for entity '{entity_id}': {reason}")]
    InvalidChange {
        /// The offending entity, or an empty string if it had none.
        entity_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An operation name could not be parsed.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// A resolution name could not be parsed.
    #[error("unknown resolution: {0}")]
    UnknownResolution(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates an invalid-change error.
    pub fn invalid(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidChange {
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }
}
