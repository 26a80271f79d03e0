//! Persistent, coalescing queue of pending local changes.

use crate::clock::{after, Clock};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::store::{LocalStore, StoreTxn};
use ledgersync_sync_protocol::{
    coalesce, merge_fields, Coalesced, Entity, LocalChange, Operation, PendingChange, Timestamp,
    Version,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Queue of local writes awaiting server acknowledgement.
///
/// At most one [`PendingChange`] exists per entity. Every enqueue writes the
/// entity row and the pending change in the same atomic batch, so a restart
/// never finds one without the other.
pub struct MutationQueue {
    store: Arc<LocalStore>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    next_seq: AtomicU64,
    revision: AtomicU64,
}

impl MutationQueue {
    /// Opens the queue over a store, resuming sequence numbers after the
    /// highest persisted one.
    pub fn open(store: Arc<LocalStore>, clock: Arc<dyn Clock>, retry: RetryConfig) -> SyncResult<Self> {
        let next_seq = store
            .pending_changes()?
            .last()
            .map_or(0, |change| change.seq + 1);

        Ok(Self {
            store,
            clock,
            retry,
            next_seq: AtomicU64::new(next_seq),
            revision: AtomicU64::new(0),
        })
    }

    /// Records a local write.
    ///
    /// Coalesces with any pending change for the same entity. Returns the
    /// resulting pending change, or `None` when the write cancelled a create
    /// the server never saw.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty id or type, or a
    /// create/update whose payload is not a JSON object. Storage failures
    /// are returned as [`SyncError::Storage`] and leave the queue unchanged.
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> SyncResult<Option<PendingChange>> {
        if entity_id.trim().is_empty() {
            return Err(SyncError::validation(entity_id, "entity id is empty"));
        }
        if entity_type.trim().is_empty() {
            return Err(SyncError::validation(entity_id, "entity type is empty"));
        }
        if operation.has_payload() && !payload.is_object() {
            return Err(SyncError::validation(
                entity_id,
                format!("{operation} payload must be a JSON object"),
            ));
        }

        let now = self.clock.now();
        let result = self.store.transaction(|txn| {
            let entity = txn.entity(entity_id)?;
            let existing = txn.pending(entity_id)?;

            let full_payload = match operation {
                Operation::Create => payload.clone(),
                Operation::Update => match &entity {
                    Some(entity) => merge_fields(&entity.payload, &payload),
                    None => payload.clone(),
                },
                Operation::Delete => Value::Null,
            };

            let change = match existing {
                None => {
                    let base = entity.as_ref().and_then(|e| e.server_version);
                    Some(PendingChange::new(
                        entity_id,
                        entity_type,
                        operation,
                        full_payload,
                        now,
                        base,
                        self.allocate_seq(),
                    ))
                }
                Some(existing) => match coalesce(&existing, operation, &full_payload) {
                    Coalesced::Cancel => None,
                    Coalesced::Replace { operation, payload } => Some(PendingChange {
                        entity_type: entity_type.to_string(),
                        operation,
                        payload,
                        client_timestamp: now,
                        idempotency_key: Uuid::new_v4(),
                        next_attempt_at: None,
                        failure: None,
                        ..existing
                    }),
                },
            };

            match &change {
                Some(change) if change.operation == Operation::Delete => {
                    txn.delete_entity(entity_id);
                    txn.put_pending(change)?;
                }
                Some(change) => {
                    txn.put_entity(&local_entity(entity, entity_id, entity_type, &change.payload, now))?;
                    txn.put_pending(change)?;
                }
                None => {
                    txn.delete_entity(entity_id);
                    txn.delete_pending(entity_id)?;
                }
            }

            // An unresolved conflict tracks the latest local intent.
            if let Some(mut conflict) = txn.conflict_for(entity_id)? {
                match &change {
                    Some(change) => {
                        conflict.local_change = LocalChange {
                            operation: change.operation,
                            data: change.payload.clone(),
                            client_timestamp: now,
                            base_version: conflict.local_change.base_version,
                        };
                        txn.put_conflict(&conflict)?;
                    }
                    None => {
                        txn.delete_conflict(entity_id)?;
                    }
                }
            }
            Ok(change)
        })?;

        self.revision.fetch_add(1, Ordering::SeqCst);
        match &result {
            Some(change) => debug!(
                entity_id,
                entity_type,
                operation = %change.operation,
                seq = change.seq,
                "enqueued change"
            ),
            None => debug!(entity_id, entity_type, "create cancelled by delete"),
        }
        Ok(result)
    }

    /// Returns a snapshot of pending changes in enqueue order, optionally
    /// limited to one entity type.
    pub fn drain(&self, entity_type: Option<&str>) -> SyncResult<Vec<PendingChange>> {
        let mut changes = self.store.pending_changes()?;
        if let Some(entity_type) = entity_type {
            changes.retain(|change| change.entity_type == entity_type);
        }
        Ok(changes)
    }

    /// Returns the pending change for an entity.
    pub fn get(&self, entity_id: &str) -> SyncResult<Option<PendingChange>> {
        self.store.pending(entity_id)
    }

    /// Returns the number of pending changes.
    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.store.pending_changes()?.len())
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns pending changes that may be pushed at `now`: not flagged and
    /// past their backoff.
    pub fn ready(&self, now: Timestamp) -> SyncResult<Vec<PendingChange>> {
        let mut changes = self.store.pending_changes()?;
        changes.retain(|change| change.is_ready(now));
        Ok(changes)
    }

    /// Returns how long until the earliest backed-off change becomes ready,
    /// or `None` if no change is waiting on a backoff.
    pub fn next_attempt_in(&self) -> SyncResult<Option<Duration>> {
        let now = self.clock.now();
        let earliest = self
            .store
            .pending_changes()?
            .iter()
            .filter(|change| !change.is_failed())
            .filter_map(|change| change.next_attempt_at)
            .filter(|at| *at > now)
            .min();
        Ok(earliest.map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0))))
    }

    /// Removes the pending change for an entity. Returns true if one existed.
    pub fn remove(&self, entity_id: &str) -> SyncResult<bool> {
        let removed = self
            .store
            .transaction(|txn| txn.delete_pending(entity_id))?;
        Ok(removed.is_some())
    }

    /// Marks changes as sent just before they are pushed.
    ///
    /// Returns the changes that are still current. A change rewritten or
    /// cancelled since `changes` was read is dropped from the result, so
    /// only what the queue holds right now reaches the server.
    pub fn claim(&self, changes: &[PendingChange]) -> SyncResult<Vec<PendingChange>> {
        self.store.transaction(|txn| {
            let mut claimed = Vec::with_capacity(changes.len());
            for change in changes {
                let Some(mut current) = txn.pending(&change.entity_id)? else {
                    continue;
                };
                if current.idempotency_key != change.idempotency_key {
                    continue;
                }
                if !current.sent {
                    current.sent = true;
                    txn.put_pending(&current)?;
                }
                claimed.push(current);
            }
            Ok(claimed)
        })
    }

    /// Records a failed push attempt for each change in `pushed`.
    ///
    /// Changes rewritten since they were pushed are left alone. A change
    /// that exhausts its attempts is flagged failed; the others back off.
    /// Returns the number of changes flagged.
    pub fn record_failure(&self, pushed: &[PendingChange], reason: &str) -> SyncResult<usize> {
        let now = self.clock.now();
        self.store.transaction(|txn| {
            let mut flagged = 0;
            for sent in pushed {
                let Some(mut current) = txn.pending(&sent.entity_id)? else {
                    continue;
                };
                if current.idempotency_key != sent.idempotency_key {
                    continue;
                }

                current.attempts += 1;
                if self.retry.is_exhausted(current.attempts) {
                    warn!(
                        entity_id = %current.entity_id,
                        attempts = current.attempts,
                        reason,
                        "giving up on change after repeated failures"
                    );
                    current.failure = Some(reason.to_string());
                    current.next_attempt_at = None;
                    flagged += 1;
                } else {
                    let delay = self.retry.delay_for_attempt(current.attempts);
                    current.next_attempt_at = Some(after(now, delay));
                }
                txn.put_pending(&current)?;
            }
            Ok(flagged)
        })
    }

    /// Flags a change as permanently failed. It stays queued but is skipped
    /// until [`MutationQueue::retry_failed`].
    pub fn flag_failed(&self, entity_id: &str, reason: &str) -> SyncResult<bool> {
        self.store.transaction(|txn| flag_in(txn, entity_id, None, reason))
    }

    /// Clears failure flags and backoff on every change. Returns how many
    /// changes were flagged.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let cleared = self.store.transaction(|txn| {
            let mut cleared = 0;
            for mut change in txn.pending_changes()? {
                if change.is_failed() || change.next_attempt_at.is_some() {
                    cleared += usize::from(change.is_failed());
                    change.failure = None;
                    change.attempts = 0;
                    change.next_attempt_at = None;
                    txn.put_pending(&change)?;
                }
            }
            Ok(cleared)
        })?;
        if cleared > 0 {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        Ok(cleared)
    }

    /// Monotonic counter bumped by every local write into the queue.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Re-queues `payload` as a fresh change at the back of the queue.
    ///
    /// Used when a conflict is resolved in favour of local data.
    pub(crate) fn requeue_in(
        &self,
        txn: &mut StoreTxn<'_>,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
        base_version: Option<Version>,
    ) -> SyncResult<PendingChange> {
        let change = PendingChange::new(
            entity_id,
            entity_type,
            operation,
            payload,
            self.clock.now(),
            base_version,
            self.allocate_seq(),
        );
        txn.put_pending(&change)?;
        Ok(change)
    }

    /// Marks that a transaction staged by [`MutationQueue::requeue_in`]
    /// committed.
    pub(crate) fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}

/// Flags the pending change for `entity_id` inside a transaction.
///
/// When `sent_key` is given, a change rewritten since it was sent is left
/// alone. Returns true if a change was flagged.
pub(crate) fn flag_in(
    txn: &mut StoreTxn<'_>,
    entity_id: &str,
    sent_key: Option<Uuid>,
    reason: &str,
) -> SyncResult<bool> {
    let Some(mut change) = txn.pending(entity_id)? else {
        return Ok(false);
    };
    if sent_key.is_some_and(|key| key != change.idempotency_key) {
        return Ok(false);
    }
    warn!(entity_id, reason, "flagging change as failed");
    change.failure = Some(reason.to_string());
    change.next_attempt_at = None;
    txn.put_pending(&change)?;
    Ok(true)
}

fn local_entity(
    existing: Option<Entity>,
    entity_id: &str,
    entity_type: &str,
    payload: &Value,
    now: Timestamp,
) -> Entity {
    match existing {
        Some(entity) => Entity {
            entity_type: entity_type.to_string(),
            payload: payload.clone(),
            local_version: entity.local_version + 1,
            updated_at: now,
            ..entity
        },
        None => Entity::local(entity_id, entity_type, payload.clone(), now),
    }
}
