//! Protocol messages for push and pull.
//!
//! The HTTP contract these messages model:
//!
//! ```text
//! POST /sync/push {changes:[...]}        -> {acked:[ids], ackedVersions:{id:v}, conflicts:[...], rejected:[...]}
//! GET  /sync/pull?since=<cursor>&limit=N -> {changes:[...], newCursor, hasMore}
//! ```

use crate::entity::{Timestamp, Version};
use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque marker used to request only server changes after a point.
///
/// The reference server encodes its change-log sequence number; clients
/// must treat the value as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Creates a cursor from its opaque string form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Creates a cursor from a sequence number.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(sequence.to_string())
    }

    /// Returns the sequence number, if the cursor encodes one.
    pub fn as_sequence(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    /// Returns the opaque string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the "from the beginning" cursor.
    pub fn is_initial(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire form of a pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushChange {
    /// Entity ID.
    pub entity_id: String,
    /// Domain type.
    pub entity_type: String,
    /// Operation.
    pub operation: Operation,
    /// Payload (`null` for deletes).
    pub payload: Value,
    /// Time of the local write.
    pub client_timestamp: Timestamp,
    /// Deduplication key for retried pushes.
    pub idempotency_key: Uuid,
    /// Server version the write was based on.
    pub base_version: Option<Version>,
}

/// Push request from client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushRequest {
    /// Changes in queue order.
    pub changes: Vec<PushChange>,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(changes: Vec<PushChange>) -> Self {
        Self { changes }
    }
}

/// A pushed change the server refused because its own version moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConflict {
    /// Entity ID.
    pub entity_id: String,
    /// Current server payload (`null` if deleted on the server).
    pub server_data: Value,
    /// Time of the server write.
    pub server_timestamp: Timestamp,
    /// Current server version.
    #[serde(default)]
    pub server_version: Option<Version>,
}

/// A pushed change the server rejected as invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    /// Entity ID.
    pub entity_id: String,
    /// Server-supplied reason.
    pub reason: String,
}

/// Push response from server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Entity IDs whose changes were applied.
    pub acked: Vec<String>,
    /// Server version produced by each acknowledged change, by entity ID.
    /// Servers that omit it leave clients to learn versions from pulls.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub acked_versions: BTreeMap<String, Version>,
    /// Changes not applied because of a concurrent server change.
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
    /// Changes not applied because they were invalid.
    #[serde(default)]
    pub rejected: Vec<RejectedChange>,
}

impl PushResponse {
    /// Creates a response that acknowledges every given entity.
    pub fn acked(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            acked: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Records an acknowledged change and the version it produced.
    pub fn ack(&mut self, entity_id: impl Into<String>, version: Version) {
        let entity_id = entity_id.into();
        self.acked_versions.insert(entity_id.clone(), version);
        self.acked.push(entity_id);
    }

    /// Returns the server version an acknowledged change produced, if the
    /// server reported it.
    pub fn acked_version(&self, entity_id: &str) -> Option<Version> {
        self.acked_versions.get(entity_id).copied()
    }
}

/// Pull request from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Cursor returned by the previous pull.
    pub since: Cursor,
    /// Maximum number of changes to return.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a new pull request.
    pub fn new(since: Cursor, limit: u32) -> Self {
        Self { since, limit }
    }
}

/// A server-side change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDelta {
    /// Entity ID.
    pub entity_id: String,
    /// Domain type.
    pub entity_type: String,
    /// True if the server deleted the entity.
    #[serde(default)]
    pub deleted: bool,
    /// New payload (`null` when deleted).
    #[serde(default)]
    pub payload: Value,
    /// Server version after this change.
    pub server_version: Version,
    /// Time of the server write.
    pub server_timestamp: Timestamp,
}

impl EntityDelta {
    /// Checks the delta is structurally applicable.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChange`] for an empty id or type, or a
    /// live delta whose payload is not a JSON object.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(ProtocolError::invalid("", "entity id is empty"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(ProtocolError::invalid(&self.entity_id, "entity type is empty"));
        }
        if !self.deleted && !self.payload.is_object() {
            return Err(ProtocolError::invalid(
                &self.entity_id,
                "payload must be a JSON object",
            ));
        }
        Ok(())
    }

    /// Returns the payload as seen by conflict comparison (`null` if deleted).
    pub fn effective_payload(&self) -> Value {
        if self.deleted {
            Value::Null
        } else {
            self.payload.clone()
        }
    }
}

/// A pulled change that could not be decoded or validated.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedChange {
    /// Entity ID, if one could be read.
    pub entity_id: Option<String>,
    /// Why the change was refused.
    pub reason: String,
}

/// Pull response from server.
///
/// Changes are carried as raw JSON so one malformed item does not make the
/// whole response undecodable; see [`PullResponse::decode_changes`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Raw changes in server order.
    pub changes: Vec<Value>,
    /// Cursor to send with the next pull.
    pub new_cursor: Cursor,
    /// True if more changes are available after `new_cursor`.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    /// Builds a response from typed deltas.
    ///
    /// # Errors
    ///
    /// Returns an error if a delta cannot be converted to JSON.
    pub fn from_deltas(
        deltas: &[EntityDelta],
        new_cursor: Cursor,
        has_more: bool,
    ) -> ProtocolResult<Self> {
        let changes = deltas
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            changes,
            new_cursor,
            has_more,
        })
    }

    /// Decodes and validates each change independently.
    pub fn decode_changes(&self) -> (Vec<EntityDelta>, Vec<MalformedChange>) {
        let mut deltas = Vec::with_capacity(self.changes.len());
        let mut malformed = Vec::new();

        for raw in &self.changes {
            let entity_id = raw
                .get("entityId")
                .and_then(Value::as_str)
                .map(str::to_string);

            let decoded = serde_json::from_value::<EntityDelta>(raw.clone())
                .map_err(ProtocolError::from)
                .and_then(|delta| delta.validate().map(|()| delta));

            match decoded {
                Ok(delta) => deltas.push(delta),
                Err(err) => malformed.push(MalformedChange {
                    entity_id,
                    reason: err.to_string(),
                }),
            }
        }

        (deltas, malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(id: &str, version: Version) -> EntityDelta {
        EntityDelta {
            entity_id: id.into(),
            entity_type: "account".into(),
            deleted: false,
            payload: json!({"name": id}),
            server_version: version,
            server_timestamp: 1_000,
        }
    }

    #[test]
    fn cursor_sequence() {
        assert_eq!(Cursor::from_sequence(42).as_sequence(), Some(42));
        assert!(Cursor::default().is_initial());
        assert_eq!(Cursor::new("opaque").as_sequence(), None);
    }

    #[test]
    fn pull_response_isolates_malformed_items() {
        let mut response =
            PullResponse::from_deltas(&[delta("a", 1), delta("b", 2)], Cursor::from_sequence(2), false)
                .unwrap();
        response.changes.push(json!({"entityId": "c", "serverVersion": "nope"}));
        response.changes.push(json!({
            "entityId": "d", "entityType": "account", "payload": [1],
            "serverVersion": 3, "serverTimestamp": 5
        }));

        let (deltas, malformed) = response.decode_changes();
        assert_eq!(deltas.len(), 2);
        assert_eq!(malformed.len(), 2);
        assert_eq!(malformed[0].entity_id.as_deref(), Some("c"));
        assert_eq!(malformed[1].entity_id.as_deref(), Some("d"));
    }

    #[test]
    fn deleted_delta_needs_no_payload() {
        let raw = json!({
            "entityId": "a", "entityType": "account", "deleted": true,
            "serverVersion": 4, "serverTimestamp": 9
        });
        let delta: EntityDelta = serde_json::from_value(raw).unwrap();
        assert!(delta.validate().is_ok());
        assert!(delta.effective_payload().is_null());
    }

    #[test]
    fn push_response_defaults() {
        let response: PushResponse = serde_json::from_value(json!({"acked": ["x"]})).unwrap();
        assert_eq!(response, PushResponse::acked(["x"]));
        assert!(response.conflicts.is_empty());
        assert_eq!(response.acked_version("x"), None);
    }

    #[test]
    fn acked_versions_travel_with_the_ack() {
        let mut response = PushResponse::default();
        response.ack("acct-1", 3);

        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["ackedVersions"], json!({"acct-1": 3}));
        let decoded: PushResponse = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.acked, vec!["acct-1".to_string()]);
        assert_eq!(decoded.acked_version("acct-1"), Some(3));
    }

    #[test]
    fn pull_response_wire_shape() {
        let response = PullResponse::from_deltas(&[], Cursor::from_sequence(7), true).unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value, json!({"changes": [], "newCursor": "7", "hasMore": true}));
    }
}
