//! Typed local store over a [`KvBackend`].
//!
//! Every write in the engine, from the domain write path and from the sync
//! cycle alike, goes through [`LocalStore::transaction`]. Transactions are
//! serialized by a single writer lock and committed as one [`WriteBatch`],
//! so readers never observe half of a logical change.

use crate::error::{SyncError, SyncResult};
use crate::listeners::{Listeners, Subscription};
use ledgersync_storage::{KvBackend, StorageError, Table, WriteBatch};
use ledgersync_sync_protocol::{Entity, PendingChange, SyncConflict};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Meta key of the pull cursor.
pub(crate) const CURSOR_KEY: &str = "cursor";
/// Meta key of the last successful sync time.
pub(crate) const LAST_SYNC_KEY: &str = "last_sync_time";

/// Net effect of one committed transaction on the queue and conflict tables.
///
/// Deltas are additive, so observers may apply them in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreDelta {
    /// Change in pending count per entity type.
    pub pending_by_type: BTreeMap<String, i64>,
    /// Change in the number of pending changes flagged as failed.
    pub failed: i64,
    /// Change in the number of unresolved conflicts.
    pub conflicts: i64,
}

impl StoreDelta {
    /// Returns true if the transaction changed no counts.
    pub fn is_empty(&self) -> bool {
        self.failed == 0 && self.conflicts == 0 && self.pending_by_type.values().all(|n| *n == 0)
    }

    fn count_pending(&mut self, change: &PendingChange, sign: i64) {
        *self
            .pending_by_type
            .entry(change.entity_type.clone())
            .or_insert(0) += sign;
        if change.is_failed() {
            self.failed += sign;
        }
    }

    fn settle(&mut self) {
        self.pending_by_type.retain(|_, n| *n != 0);
    }
}

/// Typed access to entities, pending changes, conflicts and metadata.
pub struct LocalStore {
    backend: Arc<dyn KvBackend>,
    writer: Mutex<()>,
    observers: Listeners<StoreDelta>,
}

impl LocalStore {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            writer: Mutex::new(()),
            observers: Listeners::new(),
        }
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Registers a callback invoked after every commit that changed counts.
    pub fn subscribe(&self, callback: impl Fn(&StoreDelta) + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    /// Runs `f` under the writer lock and commits what it staged.
    ///
    /// If `f` fails nothing is written. If the commit fails the store is
    /// unchanged and the storage error is returned.
    pub fn transaction<R>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> SyncResult<R>,
    ) -> SyncResult<R> {
        let (value, delta) = {
            let _writer = self.writer.lock();
            let mut txn = StoreTxn::new(self.backend.as_ref());
            let value = f(&mut txn)?;
            let (batch, delta) = txn.finish();
            if !batch.is_empty() {
                self.backend.commit(batch)?;
            }
            (value, delta)
        };

        if !delta.is_empty() {
            self.observers.notify(&delta);
        }
        Ok(value)
    }

    /// Returns an entity.
    pub fn entity(&self, id: &str) -> SyncResult<Option<Entity>> {
        read(self.backend.as_ref(), Table::Entities, id)
    }

    /// Returns every entity, ordered by ID.
    pub fn entities(&self) -> SyncResult<Vec<Entity>> {
        read_all(self.backend.as_ref(), Table::Entities)
    }

    /// Returns the pending change for an entity.
    pub fn pending(&self, entity_id: &str) -> SyncResult<Option<PendingChange>> {
        read(self.backend.as_ref(), Table::Pending, entity_id)
    }

    /// Returns every pending change in queue order.
    pub fn pending_changes(&self) -> SyncResult<Vec<PendingChange>> {
        let mut changes: Vec<PendingChange> = read_all(self.backend.as_ref(), Table::Pending)?;
        changes.sort_by_key(|change| change.seq);
        Ok(changes)
    }

    /// Returns the unresolved conflict for an entity.
    pub fn conflict_for(&self, entity_id: &str) -> SyncResult<Option<SyncConflict>> {
        read(self.backend.as_ref(), Table::Conflicts, entity_id)
    }

    /// Returns every unresolved conflict, oldest first.
    pub fn conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        let mut conflicts: Vec<SyncConflict> = read_all(self.backend.as_ref(), Table::Conflicts)?;
        conflicts.sort_by(|a, b| (a.detected_at, &a.id).cmp(&(b.detected_at, &b.id)));
        Ok(conflicts)
    }

    /// Returns a metadata value.
    pub fn meta<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        read(self.backend.as_ref(), Table::Meta, key)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

/// Writes staged inside [`LocalStore::transaction`].
///
/// Reads see the transaction's own staged writes.
pub struct StoreTxn<'a> {
    backend: &'a dyn KvBackend,
    batch: WriteBatch,
    staged: BTreeMap<(Table, String), Option<Vec<u8>>>,
    delta: StoreDelta,
}

impl<'a> StoreTxn<'a> {
    fn new(backend: &'a dyn KvBackend) -> Self {
        Self {
            backend,
            batch: WriteBatch::new(),
            staged: BTreeMap::new(),
            delta: StoreDelta::default(),
        }
    }

    fn finish(mut self) -> (WriteBatch, StoreDelta) {
        self.delta.settle();
        (self.batch, self.delta)
    }

    fn raw(&self, table: Table, key: &str) -> SyncResult<Option<Vec<u8>>> {
        match self.staged.get(&(table, key.to_string())) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.backend.get(table, key)?),
        }
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> SyncResult<Option<T>> {
        self.raw(table, key)?
            .map(|bytes| decode(table, key, &bytes))
            .transpose()
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> SyncResult<Vec<T>> {
        let mut rows: BTreeMap<String, Vec<u8>> = self.backend.scan(table)?.into_iter().collect();
        for ((staged_table, key), value) in &self.staged {
            if *staged_table != table {
                continue;
            }
            match value {
                Some(bytes) => rows.insert(key.clone(), bytes.clone()),
                None => rows.remove(key),
            };
        }
        rows.iter()
            .map(|(key, bytes)| decode(table, key, bytes))
            .collect()
    }

    fn put<T: Serialize>(&mut self, table: Table, key: &str, value: &T) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.batch.put(table, key, bytes.clone());
        self.staged.insert((table, key.to_string()), Some(bytes));
        Ok(())
    }

    fn remove(&mut self, table: Table, key: &str) {
        self.batch.delete(table, key);
        self.staged.insert((table, key.to_string()), None);
    }

    /// Returns an entity.
    pub fn entity(&self, id: &str) -> SyncResult<Option<Entity>> {
        self.get(Table::Entities, id)
    }

    /// Stages an entity write.
    pub fn put_entity(&mut self, entity: &Entity) -> SyncResult<()> {
        self.put(Table::Entities, &entity.id, entity)
    }

    /// Stages an entity removal.
    pub fn delete_entity(&mut self, id: &str) {
        self.remove(Table::Entities, id);
    }

    /// Returns the pending change for an entity.
    pub fn pending(&self, entity_id: &str) -> SyncResult<Option<PendingChange>> {
        self.get(Table::Pending, entity_id)
    }

    /// Returns every pending change in queue order.
    pub fn pending_changes(&self) -> SyncResult<Vec<PendingChange>> {
        let mut changes: Vec<PendingChange> = self.scan(Table::Pending)?;
        changes.sort_by_key(|change| change.seq);
        Ok(changes)
    }

    /// Stages a pending change, replacing any existing one for the entity.
    pub fn put_pending(&mut self, change: &PendingChange) -> SyncResult<()> {
        if let Some(previous) = self.pending(&change.entity_id)? {
            self.delta.count_pending(&previous, -1);
        }
        self.delta.count_pending(change, 1);
        self.put(Table::Pending, &change.entity_id, change)
    }

    /// Stages removal of an entity's pending change. Returns what was removed.
    pub fn delete_pending(&mut self, entity_id: &str) -> SyncResult<Option<PendingChange>> {
        let previous = self.pending(entity_id)?;
        if let Some(previous) = &previous {
            self.delta.count_pending(previous, -1);
            self.remove(Table::Pending, entity_id);
        }
        Ok(previous)
    }

    /// Returns the unresolved conflict for an entity.
    pub fn conflict_for(&self, entity_id: &str) -> SyncResult<Option<SyncConflict>> {
        self.get(Table::Conflicts, entity_id)
    }

    /// Returns every unresolved conflict.
    pub fn conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        self.scan(Table::Conflicts)
    }

    /// Stages a conflict, replacing any existing one for the entity.
    pub fn put_conflict(&mut self, conflict: &SyncConflict) -> SyncResult<()> {
        if self.conflict_for(&conflict.entity_id)?.is_none() {
            self.delta.conflicts += 1;
        }
        self.put(Table::Conflicts, &conflict.entity_id, conflict)
    }

    /// Stages removal of an entity's conflict. Returns what was removed.
    pub fn delete_conflict(&mut self, entity_id: &str) -> SyncResult<Option<SyncConflict>> {
        let previous = self.conflict_for(entity_id)?;
        if previous.is_some() {
            self.delta.conflicts -= 1;
            self.remove(Table::Conflicts, entity_id);
        }
        Ok(previous)
    }

    /// Returns a metadata value.
    pub fn meta<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        self.get(Table::Meta, key)
    }

    /// Stages a metadata write.
    pub fn set_meta<T: Serialize>(&mut self, key: &str, value: &T) -> SyncResult<()> {
        self.put(Table::Meta, key, value)
    }
}

fn decode<T: DeserializeOwned>(table: Table, key: &str, bytes: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(bytes).map_err(|err| {
        SyncError::Storage(StorageError::Corrupted(format!("{table}/{key}: {err}")))
    })
}

fn read<T: DeserializeOwned>(backend: &dyn KvBackend, table: Table, key: &str) -> SyncResult<Option<T>> {
    backend
        .get(table, key)?
        .map(|bytes| decode(table, key, &bytes))
        .transpose()
}

fn read_all<T: DeserializeOwned>(backend: &dyn KvBackend, table: Table) -> SyncResult<Vec<T>> {
    backend
        .scan(table)?
        .iter()
        .map(|(key, bytes)| decode(table, key, bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_storage::InMemoryBackend;
    use ledgersync_sync_protocol::Operation;
    use serde_json::json;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(InMemoryBackend::new()))
    }

    fn change(id: &str, entity_type: &str, seq: u64) -> PendingChange {
        PendingChange::new(id, entity_type, Operation::Update, json!({"v": seq}), 0, None, seq)
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = store();
        store
            .transaction(|txn| {
                txn.put_entity(&Entity::local("a", "account", json!({"name": "A"}), 1))?;
                assert!(txn.entity("a")?.is_some());
                txn.delete_entity("a");
                assert!(txn.entity("a")?.is_none());
                Ok(())
            })
            .unwrap();
        assert!(store.entity("a").unwrap().is_none());
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let store = store();
        let result: SyncResult<()> = store.transaction(|txn| {
            txn.put_pending(&change("a", "account", 1))?;
            Err(SyncError::Cancelled)
        });
        assert!(result.is_err());
        assert!(store.pending_changes().unwrap().is_empty());
    }

    #[test]
    fn delta_tracks_pending_and_conflict_counts() {
        let store = store();
        let deltas = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deltas);
        let _subscription = store.subscribe(move |delta| sink.lock().push(delta.clone()));

        store
            .transaction(|txn| {
                txn.put_pending(&change("a", "account", 1))?;
                txn.put_pending(&change("a", "account", 1))?;
                txn.put_pending(&change("t", "transaction", 2))?;
                Ok(())
            })
            .unwrap();
        store
            .transaction(|txn| txn.delete_pending("t").map(|_| ()))
            .unwrap();

        let deltas = deltas.lock();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].pending_by_type.get("account"), Some(&1));
        assert_eq!(deltas[0].pending_by_type.get("transaction"), Some(&1));
        assert_eq!(deltas[1].pending_by_type.get("transaction"), Some(&-1));
    }

    #[test]
    fn pending_changes_are_in_queue_order() {
        let store = store();
        store
            .transaction(|txn| {
                txn.put_pending(&change("z", "account", 1))?;
                txn.put_pending(&change("a", "account", 2))?;
                Ok(())
            })
            .unwrap();
        let ids: Vec<_> = store
            .pending_changes()
            .unwrap()
            .into_iter()
            .map(|c| c.entity_id)
            .collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn corrupt_rows_surface_as_storage_errors() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut batch = WriteBatch::new();
        batch.put(Table::Entities, "bad", b"not json".to_vec());
        backend.commit(batch).unwrap();

        let store = LocalStore::new(backend);
        assert!(matches!(store.entity("bad"), Err(SyncError::Storage(_))));
    }
}
