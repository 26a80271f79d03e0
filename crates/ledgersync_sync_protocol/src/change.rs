//! Pending local changes and their coalescing rules.

use crate::entity::{Timestamp, Version};
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::PushChange;
use crate::operation::Operation;
use crate::payload::merge_fields;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A local mutation not yet acknowledged by the server.
///
/// # Invariants
///
/// - At most one pending change exists per `entity_id`
/// - `seq` is the queue position of the first write that created the entry
///   and is preserved when later writes coalesce into it
/// - `payload` is `Value::Null` for deletes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    /// Entity ID.
    pub entity_id: String,
    /// Domain type of the entity.
    pub entity_type: String,
    /// Coalesced operation.
    pub operation: Operation,
    /// Payload to push.
    pub payload: Value,
    /// Time of the latest local write folded into this change.
    pub client_timestamp: Timestamp,
    /// Number of failed push attempts.
    pub attempts: u32,
    /// Key the server uses to deduplicate retried pushes.
    pub idempotency_key: Uuid,
    /// Server version the local write was based on.
    pub base_version: Option<Version>,
    /// Queue position.
    pub seq: u64,
    /// Earliest time the next push attempt may happen.
    #[serde(default)]
    pub next_attempt_at: Option<Timestamp>,
    /// Why the change was flagged as failed, if it was.
    #[serde(default)]
    pub failure: Option<String>,
    /// True once the change was handed to a transport. The server may hold
    /// it even if no acknowledgement arrived.
    #[serde(default)]
    pub sent: bool,
}

impl PendingChange {
    /// Creates a fresh pending change.
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        operation: Operation,
        payload: Value,
        client_timestamp: Timestamp,
        base_version: Option<Version>,
        seq: u64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            operation,
            payload: if operation.has_payload() {
                payload
            } else {
                Value::Null
            },
            client_timestamp,
            attempts: 0,
            idempotency_key: Uuid::new_v4(),
            base_version,
            seq,
            next_attempt_at: None,
            failure: None,
            sent: false,
        }
    }

    /// Returns true if the change was flagged and is no longer retried.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Returns true if the change may be pushed at `now`.
    pub fn is_ready(&self, now: Timestamp) -> bool {
        !self.is_failed() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Checks the change is structurally pushable.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChange`] for an empty id or type, or a
    /// create/update whose payload is not a JSON object.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(ProtocolError::invalid("", "entity id is empty"));
        }
        if self.entity_type.trim().is_empty() {
            return Err(ProtocolError::invalid(&self.entity_id, "entity type is empty"));
        }
        if self.operation.has_payload() && !self.payload.is_object() {
            return Err(ProtocolError::invalid(
                &self.entity_id,
                format!("{} payload must be a JSON object", self.operation),
            ));
        }
        Ok(())
    }

    /// Builds the wire form of this change.
    pub fn to_push(&self) -> PushChange {
        PushChange {
            entity_id: self.entity_id.clone(),
            entity_type: self.entity_type.clone(),
            operation: self.operation,
            payload: self.payload.clone(),
            client_timestamp: self.client_timestamp,
            idempotency_key: self.idempotency_key,
            base_version: self.base_version,
        }
    }
}

/// Outcome of folding a new local write into an existing pending change.
#[derive(Debug, Clone, PartialEq)]
pub enum Coalesced {
    /// The pending change becomes this operation and payload.
    Replace {
        /// Resulting operation.
        operation: Operation,
        /// Resulting payload.
        payload: Value,
    },
    /// The writes cancel out; the pending change is removed.
    Cancel,
}

/// Folds a new local write into the pending change for the same entity.
///
/// | existing \ new | Create | Update | Delete |
/// |---|---|---|---|
/// | Create | Create (replaced) | Create (merged) | cancel |
/// | Update | Update (replaced) | Update (merged) | Delete |
/// | Delete | Update (replaced) | Update (replaced) | Delete |
///
/// A create that was already sent may have reached the server without an
/// acknowledgement, so deleting it yields a `Delete` rather than a cancel.
pub fn coalesce(existing: &PendingChange, operation: Operation, payload: &Value) -> Coalesced {
    use Operation::{Create, Delete, Update};

    let replace = |operation, payload| Coalesced::Replace { operation, payload };
    match (existing.operation, operation) {
        (Create, Create) => replace(Create, payload.clone()),
        (Create, Update) => replace(Create, merge_fields(&existing.payload, payload)),
        (Create, Delete) if !existing.sent && existing.attempts == 0 => Coalesced::Cancel,
        (Create, Delete) | (Update, Delete) | (Delete, Delete) => replace(Delete, Value::Null),
        (Update, Create) | (Delete, Create) | (Delete, Update) => replace(Update, payload.clone()),
        (Update, Update) => replace(Update, merge_fields(&existing.payload, payload)),
    }
}
