//! Transactional application of conflict resolutions.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::queue::MutationQueue;
use crate::store::{LocalStore, StoreTxn};
use ledgersync_sync_protocol::{
    ConflictStatus, Entity, Operation, Resolution, SyncConflict, Timestamp, Version,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A per-entity-type merge: `(local, server) -> merged`.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Registered merge functions, keyed by entity type.
///
/// Without a registered function, [`Resolution::Merge`] behaves exactly like
/// [`Resolution::Server`].
#[derive(Default)]
pub struct MergeRegistry {
    merges: RwLock<HashMap<String, MergeFn>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the merge for an entity type, replacing any previous one.
    pub fn register(
        &self,
        entity_type: impl Into<String>,
        merge: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.merges.write().insert(entity_type.into(), Arc::new(merge));
    }

    /// Returns the merge for an entity type.
    pub fn get(&self, entity_type: &str) -> Option<MergeFn> {
        self.merges.read().get(entity_type).cloned()
    }

    /// Returns true if a merge is registered for the type.
    pub fn contains(&self, entity_type: &str) -> bool {
        self.merges.read().contains_key(entity_type)
    }
}

impl std::fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.merges.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("MergeRegistry").field("types", &types).finish()
    }
}

/// What a resolution does to the entity.
enum Outcome {
    /// Take the server side and drop the local change.
    TakeServer,
    /// Keep this data locally and push it again.
    Keep(Value),
}

/// Applies resolutions to the store and queue in one atomic batch.
pub struct ResolutionApplier {
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    merges: Arc<MergeRegistry>,
    clock: Arc<dyn Clock>,
}

impl ResolutionApplier {
    /// Creates an applier.
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<MutationQueue>,
        merges: Arc<MergeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            merges,
            clock,
        }
    }

    /// Returns the merge registry.
    pub fn merges(&self) -> &Arc<MergeRegistry> {
        &self.merges
    }

    /// Resolves a conflict.
    ///
    /// - `Local`: the local data stays and is re-queued as a fresh change
    ///   based on the server's version.
    /// - `Server`: the server data overwrites the entity and the pending
    ///   change is dropped.
    /// - `Merge`: the registered merge for the entity type produces data that
    ///   is kept like `Local`; with no merge registered, or when one side is
    ///   a deletion, it behaves like `Server`.
    ///
    /// The entity write, the pending change update and the conflict removal
    /// commit together or not at all.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConflictNotFound`] if no unresolved conflict has
    /// this ID, or a storage error if the commit fails.
    pub fn resolve(&self, conflict_id: &str, resolution: Resolution) -> SyncResult<SyncConflict> {
        let now = self.clock.now();
        let (resolved, requeued) = self.store.transaction(|txn| {
            let conflict = txn
                .conflicts()?
                .into_iter()
                .find(|conflict| conflict.id == conflict_id)
                .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;

            let requeued = match self.outcome(&conflict, resolution) {
                Outcome::TakeServer => {
                    take_server(txn, &conflict, now)?;
                    false
                }
                Outcome::Keep(data) => {
                    self.keep(txn, &conflict, data, now)?;
                    true
                }
            };
            txn.delete_conflict(&conflict.entity_id)?;

            Ok((
                SyncConflict {
                    status: ConflictStatus::Resolved,
                    ..conflict
                },
                requeued,
            ))
        })?;

        if requeued {
            self.queue.bump_revision();
        }
        info!(
            conflict_id,
            entity_id = %resolved.entity_id,
            resolution = %resolution,
            "conflict resolved"
        );
        Ok(resolved)
    }

    fn outcome(&self, conflict: &SyncConflict, resolution: Resolution) -> Outcome {
        match resolution {
            Resolution::Local => Outcome::Keep(conflict.local_change.data.clone()),
            Resolution::Server => Outcome::TakeServer,
            Resolution::Merge => {
                let merge = self.merges.get(&conflict.entity_type);
                match merge {
                    Some(merge) if !conflict.local_deleted() && !conflict.server_deleted() => {
                        Outcome::Keep(merge(
                            &conflict.local_change.data,
                            &conflict.server_change.data,
                        ))
                    }
                    Some(_) => {
                        warn!(
                            conflict_id = %conflict.id,
                            "cannot merge against a deletion; resolving with server data"
                        );
                        Outcome::TakeServer
                    }
                    None => {
                        warn!(
                            conflict_id = %conflict.id,
                            entity_type = %conflict.entity_type,
                            "no merge registered for entity type; resolving with server data"
                        );
                        Outcome::TakeServer
                    }
                }
            }
        }
    }

    fn keep(
        &self,
        txn: &mut StoreTxn<'_>,
        conflict: &SyncConflict,
        data: Value,
        now: Timestamp,
    ) -> SyncResult<()> {
        let entity_id = conflict.entity_id.as_str();
        let base_version = server_version(txn, conflict)?;
        let entity = txn.entity(entity_id)?;
        txn.delete_pending(entity_id)?;

        let operation = if data.is_null() {
            txn.delete_entity(entity_id);
            Operation::Delete
        } else {
            let local_version = entity.as_ref().map_or(1, |e| e.local_version + 1);
            txn.put_entity(&Entity {
                id: entity_id.to_string(),
                entity_type: conflict.entity_type.clone(),
                payload: data.clone(),
                local_version,
                server_version: base_version,
                updated_at: now,
            })?;
            if conflict.server_deleted() {
                Operation::Create
            } else {
                Operation::Update
            }
        };

        self.queue.requeue_in(
            txn,
            &conflict.entity_type,
            entity_id,
            operation,
            data,
            base_version,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for ResolutionApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionApplier")
            .field("merges", &self.merges)
            .finish_non_exhaustive()
    }
}

fn server_version(
    txn: &StoreTxn<'_>,
    conflict: &SyncConflict,
) -> SyncResult<Option<Version>> {
    Ok(match conflict.server_change.server_version {
        Some(version) => Some(version),
        None => txn
            .entity(&conflict.entity_id)?
            .and_then(|entity| entity.server_version),
    })
}

fn take_server(txn: &mut StoreTxn<'_>, conflict: &SyncConflict, now: Timestamp) -> SyncResult<()> {
    let entity_id = conflict.entity_id.as_str();
    let version = server_version(txn, conflict)?;
    let entity = txn.entity(entity_id)?;
    txn.delete_pending(entity_id)?;

    if conflict.server_deleted() {
        txn.delete_entity(entity_id);
        return Ok(());
    }

    txn.put_entity(&Entity {
        id: entity_id.to_string(),
        entity_type: conflict.entity_type.clone(),
        payload: conflict.server_change.data.clone(),
        local_version: entity.map_or(0, |e| e.local_version),
        server_version: version,
        updated_at: now,
    })
}
