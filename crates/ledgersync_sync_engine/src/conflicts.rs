//! Persistent set of unresolved conflicts.

use crate::error::SyncResult;
use crate::store::{LocalStore, StoreTxn};
use ledgersync_sync_protocol::{
    ConflictStatus, LocalChange, ServerChange, SyncConflict, Timestamp,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Read side of the conflict table.
///
/// Conflicts are keyed by entity ID, so at most one unresolved conflict
/// exists per entity. Resolution goes through [`crate::ResolutionApplier`].
#[derive(Debug, Clone)]
pub struct ConflictStore {
    store: Arc<LocalStore>,
}

impl ConflictStore {
    /// Creates a conflict store over a local store.
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Lists unresolved conflicts, oldest first.
    pub fn list(&self) -> SyncResult<Vec<SyncConflict>> {
        self.store.conflicts()
    }

    /// Returns a conflict by its ID.
    pub fn get(&self, conflict_id: &str) -> SyncResult<Option<SyncConflict>> {
        Ok(self
            .store
            .conflicts()?
            .into_iter()
            .find(|conflict| conflict.id == conflict_id))
    }

    /// Returns the unresolved conflict for an entity.
    pub fn for_entity(&self, entity_id: &str) -> SyncResult<Option<SyncConflict>> {
        self.store.conflict_for(entity_id)
    }

    /// Returns the number of unresolved conflicts.
    pub fn count(&self) -> SyncResult<usize> {
        Ok(self.store.conflicts()?.len())
    }
}

/// Records a conflict inside a transaction.
///
/// Re-detection on an entity that already has a conflict updates that record
/// in place: the ID and detection time are kept, both sides are replaced.
pub(crate) fn upsert_in(
    txn: &mut StoreTxn<'_>,
    entity_type: &str,
    entity_id: &str,
    local: LocalChange,
    server: ServerChange,
    now: Timestamp,
) -> SyncResult<SyncConflict> {
    let conflict = match txn.conflict_for(entity_id)? {
        Some(existing) => SyncConflict {
            local_change: local,
            server_change: server,
            ..existing
        },
        None => {
            let conflict = SyncConflict {
                id: Uuid::new_v4().to_string(),
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                local_change: local,
                server_change: server,
                status: ConflictStatus::Unresolved,
                detected_at: now,
            };
            info!(
                conflict_id = %conflict.id,
                entity_id,
                entity_type,
                fields = ?conflict.changed_fields(),
                "conflict detected"
            );
            conflict
        }
    };
    txn.put_conflict(&conflict)?;
    Ok(conflict)
}
