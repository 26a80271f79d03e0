//! Fault injection for storage backends.
//!
//! [`FaultyBackend`] wraps a real backend and refuses commits on demand, so
//! tests can check that a failed write leaves every table as it was.
//!
//! ```rust
//! use ledgersync_storage::{InMemoryBackend, KvBackend, Table, WriteBatch};
//! use ledgersync_testkit::FaultyBackend;
//!
//! let backend = FaultyBackend::new(InMemoryBackend::new());
//! backend.fail_next_commits(1);
//!
//! let mut batch = WriteBatch::new();
//! batch.put(Table::Meta, "cursor", b"1".to_vec());
//! assert!(backend.commit(batch.clone()).is_err());
//! assert!(backend.commit(batch).is_ok());
//! ```

use ledgersync_storage::{KvBackend, StorageError, StorageResult, Table, WriteBatch, WriteOp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A backend wrapper that can refuse commits.
///
/// Reads always pass through. A refused commit writes nothing.
pub struct FaultyBackend<B> {
    inner: B,
    fail_next: AtomicUsize,
    fail_table: Mutex<Option<Table>>,
    failed: AtomicUsize,
    commits: AtomicUsize,
    read_only: AtomicBool,
}

impl<B: KvBackend> FaultyBackend<B> {
    /// Wraps a backend with no faults armed.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fail_next: AtomicUsize::new(0),
            fail_table: Mutex::new(None),
            failed: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
        }
    }

    /// Refuses the next `count` commits.
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Refuses every commit that touches `table` until [`Self::reset`].
    pub fn fail_on_table(&self, table: Table) {
        *self.fail_table.lock() = Some(table);
    }

    /// Refuses every commit until [`Self::reset`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Disarms every fault.
    pub fn reset(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.read_only.store(false, Ordering::SeqCst);
        *self.fail_table.lock() = None;
    }

    /// Number of commits refused so far.
    pub fn failed_commits(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Number of commits applied so far.
    pub fn applied_commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn should_fail(&self, batch: &WriteBatch) -> Option<String> {
        if self.read_only.load(Ordering::SeqCst) {
            return Some("backend is read-only".into());
        }
        let armed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Some("injected commit failure".into());
        }
        let table = (*self.fail_table.lock())?;
        batch
            .ops()
            .iter()
            .any(|op| op_table(op) == table)
            .then(|| format!("injected failure on table {table}"))
    }
}

fn op_table(op: &WriteOp) -> Table {
    match op {
        WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => *table,
    }
}

impl<B: KvBackend> KvBackend for FaultyBackend<B> {
    fn get(&self, table: Table, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(table, key)
    }

    fn scan(&self, table: Table) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan(table)
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if let Some(reason) = self.should_fail(&batch) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::WriteRejected(reason));
        }
        self.inner.commit(batch)?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_storage::InMemoryBackend;

    fn put(table: Table, key: &str) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.put(table, key, b"v".to_vec());
        batch
    }

    #[test]
    fn passes_through_when_unarmed() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.commit(put(Table::Entities, "a")).unwrap();
        assert_eq!(backend.get(Table::Entities, "a").unwrap(), Some(b"v".to_vec()));
        assert_eq!(backend.applied_commits(), 1);
    }

    #[test]
    fn fails_next_commits_then_recovers() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.fail_next_commits(2);

        assert!(backend.commit(put(Table::Entities, "a")).is_err());
        assert!(backend.commit(put(Table::Entities, "a")).is_err());
        assert!(backend.commit(put(Table::Entities, "a")).is_ok());
        assert_eq!(backend.failed_commits(), 2);
    }

    #[test]
    fn refused_commit_writes_nothing() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.fail_on_table(Table::Conflicts);

        let mut batch = put(Table::Entities, "a");
        batch.put(Table::Conflicts, "a", b"c".to_vec());
        assert!(matches!(
            backend.commit(batch),
            Err(StorageError::WriteRejected(_))
        ));
        assert_eq!(backend.get(Table::Entities, "a").unwrap(), None);

        assert!(backend.commit(put(Table::Entities, "b")).is_ok());
    }

    #[test]
    fn read_only_until_reset() {
        let backend = FaultyBackend::new(InMemoryBackend::new());
        backend.set_read_only(true);
        assert!(backend.commit(put(Table::Meta, "k")).is_err());

        backend.reset();
        assert!(backend.commit(put(Table::Meta, "k")).is_ok());
    }
}
