//! Server-side change log and entity versions.

use ledgersync_sync_protocol::{
    EntityDelta, Operation, PushChange, PushConflict, Timestamp, Version,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The server's copy of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntity {
    /// Domain type.
    pub entity_type: String,
    /// Current payload, `null` once deleted.
    pub payload: Value,
    /// Version, bumped by every write.
    pub version: Version,
    /// Time of the last write.
    pub updated_at: Timestamp,
}

impl ServerEntity {
    /// Returns true if the entity was deleted.
    pub fn is_deleted(&self) -> bool {
        self.payload.is_null()
    }
}

/// One committed write in log order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub sequence: u64,
    /// The change as pulled by clients.
    pub delta: EntityDelta,
}

/// Serializable server state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OplogSnapshot {
    /// Every write in commit order.
    pub log: Vec<LogEntry>,
    /// Current entity copies.
    pub entities: BTreeMap<String, ServerEntity>,
    /// Idempotency keys of applied pushes and the version each produced.
    pub applied_keys: BTreeMap<Uuid, Version>,
    /// Sequence of the last write.
    pub last_sequence: u64,
}

/// What happened to one pushed change.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The change was written.
    Applied {
        /// Log position of the write.
        sequence: u64,
        /// Entity version after the write.
        version: Version,
    },
    /// The idempotency key was already applied; nothing was written.
    Duplicate {
        /// Entity version the original write produced.
        version: Version,
    },
    /// The change was based on an older version and its data differs.
    Conflict(PushConflict),
    /// The change is structurally invalid.
    Rejected(String),
}

/// Server-side change log.
///
/// Maintains:
/// - Every write in commit order, for pulls
/// - The current version of each entity, for conflict detection
/// - Applied idempotency keys, so retried pushes are not applied twice
pub struct ServerOplog {
    state: RwLock<OplogSnapshot>,
}

impl ServerOplog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::from_snapshot(OplogSnapshot::default())
    }

    /// Restores a log from a snapshot.
    pub fn from_snapshot(snapshot: OplogSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    /// Returns a copy of the full state.
    pub fn snapshot(&self) -> OplogSnapshot {
        self.state.read().clone()
    }

    /// Returns the sequence of the last write (0 when empty).
    pub fn cursor(&self) -> u64 {
        self.state.read().last_sequence
    }

    /// Returns the number of writes in the log.
    pub fn len(&self) -> usize {
        self.state.read().log.len()
    }

    /// Returns true if nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.state.read().log.is_empty()
    }

    /// Returns the current copy of an entity.
    pub fn entity(&self, entity_id: &str) -> Option<ServerEntity> {
        self.state.read().entities.get(entity_id).cloned()
    }

    /// Applies one pushed change.
    ///
    /// A change conflicts when the entity's version moved past the change's
    /// base version and the data differs. A change carrying the same data
    /// as the server is written anyway, so the client learns the version
    /// from its next pull.
    pub fn apply(&self, change: &PushChange, now: Timestamp) -> ApplyOutcome {
        if let Err(reason) = validate(change) {
            return ApplyOutcome::Rejected(reason);
        }

        let mut state = self.state.write();
        if let Some(&version) = state.applied_keys.get(&change.idempotency_key) {
            return ApplyOutcome::Duplicate { version };
        }

        let data = match change.operation {
            Operation::Delete => Value::Null,
            Operation::Create | Operation::Update => change.payload.clone(),
        };

        if let Some(current) = state.entities.get(&change.entity_id) {
            let behind = change
                .base_version
                .map_or(true, |base| base < current.version);
            if behind && current.payload != data {
                return ApplyOutcome::Conflict(PushConflict {
                    entity_id: change.entity_id.clone(),
                    server_data: current.payload.clone(),
                    server_timestamp: current.updated_at,
                    server_version: Some(current.version),
                });
            }
        }

        let (sequence, delta) = record(&mut state, &change.entity_type, &change.entity_id, data, now);
        state
            .applied_keys
            .insert(change.idempotency_key, delta.server_version);
        ApplyOutcome::Applied {
            sequence,
            version: delta.server_version,
        }
    }

    /// Writes an entity directly, as another client or a server job would.
    /// `None` deletes it.
    pub fn write(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Option<Value>,
        now: Timestamp,
    ) -> EntityDelta {
        let mut state = self.state.write();
        record(
            &mut state,
            entity_type,
            entity_id,
            payload.unwrap_or(Value::Null),
            now,
        )
        .1
    }

    /// Returns up to `limit` changes after `since`, the cursor after the
    /// last returned change, and whether more remain.
    pub fn changes_since(&self, since: u64, limit: usize) -> (Vec<EntityDelta>, u64, bool) {
        let state = self.state.read();
        let start = state.log.partition_point(|entry| entry.sequence <= since);
        let remaining = &state.log[start..];
        let page = &remaining[..limit.min(remaining.len())];

        let new_cursor = page.last().map_or(since, |entry| entry.sequence);
        let deltas = page.iter().map(|entry| entry.delta.clone()).collect();
        (deltas, new_cursor, remaining.len() > page.len())
    }
}

impl Default for ServerOplog {
    fn default() -> Self {
        Self::new()
    }
}

fn record(
    state: &mut OplogSnapshot,
    entity_type: &str,
    entity_id: &str,
    data: Value,
    now: Timestamp,
) -> (u64, EntityDelta) {
    state.last_sequence += 1;
    let version = state
        .entities
        .get(entity_id)
        .map_or(1, |entity| entity.version + 1);

    state.entities.insert(
        entity_id.to_string(),
        ServerEntity {
            entity_type: entity_type.to_string(),
            payload: data.clone(),
            version,
            updated_at: now,
        },
    );

    let delta = EntityDelta {
        entity_id: entity_id.to_string(),
        entity_type: entity_type.to_string(),
        deleted: data.is_null(),
        payload: data,
        server_version: version,
        server_timestamp: now,
    };
    state.log.push(LogEntry {
        sequence: state.last_sequence,
        delta: delta.clone(),
    });
    (state.last_sequence, delta)
}

fn validate(change: &PushChange) -> Result<(), String> {
    if change.entity_id.trim().is_empty() {
        return Err("entity id is empty".into());
    }
    if change.entity_type.trim().is_empty() {
        return Err("entity type is empty".into());
    }
    if change.operation.has_payload() && !change.payload.is_object() {
        return Err(format!("{} payload must be a JSON object", change.operation));
    }
    Ok(())
}
