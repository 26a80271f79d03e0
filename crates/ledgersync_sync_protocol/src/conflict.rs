//! Sync conflicts and their resolutions.

use crate::entity::{Timestamp, Version};
use crate::error::ProtocolError;
use crate::operation::Operation;
use crate::payload::changed_fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// The local side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalChange {
    /// Pending operation at detection time.
    pub operation: Operation,
    /// Local payload (`null` for a local delete).
    pub data: Value,
    /// Time of the local write.
    pub client_timestamp: Timestamp,
    /// Server version the local write was based on.
    pub base_version: Option<Version>,
}

/// The server side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerChange {
    /// Server payload (`null` when the server deleted the entity).
    pub data: Value,
    /// Time of the server write.
    pub server_timestamp: Timestamp,
    /// Server version of `data`, if the server reported one.
    pub server_version: Option<Version>,
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    /// Awaiting an explicit resolution.
    Unresolved,
    /// A resolution was applied.
    Resolved,
}

/// A detected divergence between a pending local change and a concurrent
/// server change to the same entity.
///
/// Comparison is whole-entity: edits to disjoint fields still produce one
/// conflict. [`SyncConflict::changed_fields`] is for display only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Conflict ID.
    pub id: String,
    /// Domain type of the entity.
    pub entity_type: String,
    /// Entity ID.
    pub entity_id: String,
    /// Local side.
    pub local_change: LocalChange,
    /// Server side.
    pub server_change: ServerChange,
    /// Current status.
    pub status: ConflictStatus,
    /// Time the conflict was first detected.
    pub detected_at: Timestamp,
}

impl SyncConflict {
    /// Returns true if the conflict still needs a resolution.
    pub fn is_unresolved(&self) -> bool {
        self.status == ConflictStatus::Unresolved
    }

    /// Returns true if the server side is a deletion.
    pub fn server_deleted(&self) -> bool {
        self.server_change.data.is_null()
    }

    /// Returns true if the local side is a deletion.
    pub fn local_deleted(&self) -> bool {
        self.local_change.operation == Operation::Delete
    }

    /// Top-level payload keys that differ between the two sides.
    pub fn changed_fields(&self) -> Vec<String> {
        changed_fields(&self.local_change.data, &self.server_change.data)
    }
}

/// How a conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// Keep the local payload and push it again.
    Local,
    /// Take the server payload and drop the local change.
    Server,
    /// Apply a registered merge function, or behave as `Server`.
    Merge,
}

impl Resolution {
    /// Returns the wire name of the resolution.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "LOCAL",
            Resolution::Server => "SERVER",
            Resolution::Merge => "MERGE",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Resolution::Local),
            "server" => Ok(Resolution::Server),
            "merge" => Ok(Resolution::Merge),
            _ => Err(ProtocolError::UnknownResolution(s.to_string())),
        }
    }
}
