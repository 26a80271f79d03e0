//! Versioned domain records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

/// Monotonic server-assigned version of an entity.
pub type Version = u64;

/// A versioned domain record tracked by the sync engine.
///
/// The payload is opaque to the engine. `local_version` counts local writes;
/// `server_version` is the last version the server confirmed, or `None` if
/// the entity has never been seen by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Entity ID.
    pub id: String,
    /// Domain type, e.g. `account` or `budget`.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Opaque JSON payload.
    pub payload: Value,
    /// Number of local writes applied to this entity.
    pub local_version: u64,
    /// Last server version applied locally.
    pub server_version: Option<Version>,
    /// Time of the last write, local or remote.
    pub updated_at: Timestamp,
}

impl Entity {
    /// Creates an entity that has only been written locally.
    pub fn local(
        id: impl Into<String>,
        entity_type: impl Into<String>,
        payload: Value,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            payload,
            local_version: 1,
            server_version: None,
            updated_at,
        }
    }

    /// Returns true if the server has confirmed some version of this entity.
    pub fn is_known_to_server(&self) -> bool {
        self.server_version.is_some()
    }
}
