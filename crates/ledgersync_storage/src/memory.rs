//! In-memory storage backend for testing.

use crate::backend::{apply_ops, KvBackend, Table, Tables, WriteBatch};
use crate::error::StorageResult;
use parking_lot::RwLock;

/// An in-memory key/value backend.
///
/// This backend stores all tables in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral stores that don't need persistence
///
/// # Thread Safety
///
/// A single write lock is held while a batch is applied, so readers
/// never see half of a batch.
///
/// # Example
///
/// ```rust
/// use ledgersync_storage::{InMemoryBackend, KvBackend, Table, WriteBatch};
///
/// let backend = InMemoryBackend::new();
/// let mut batch = WriteBatch::new();
/// batch.put(Table::Entities, "acct-1", b"{}".to_vec());
/// backend.commit(batch).unwrap();
/// assert_eq!(backend.count(Table::Entities).unwrap(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<Tables>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all tables.
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}

impl KvBackend for InMemoryBackend {
    fn get(&self, table: Table, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn scan(&self, table: Table) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut tables = self.tables.write();
        apply_ops(&mut tables, batch.ops());
        Ok(())
    }
}
