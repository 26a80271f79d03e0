//! Storage backend trait definition.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fixed set of tables a backend stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    /// Local copies of domain entities.
    Entities,
    /// Pending (not yet acknowledged) local changes.
    Pending,
    /// Sync conflicts awaiting resolution.
    Conflicts,
    /// Engine metadata such as the pull cursor.
    Meta,
}

impl Table {
    /// All tables, in storage order.
    pub const ALL: [Table; 4] = [Table::Entities, Table::Pending, Table::Conflicts, Table::Meta];

    /// Returns the table's display name.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::Pending => "pending",
            Table::Conflicts => "conflicts",
            Table::Meta => "meta",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert or overwrite a value.
    Put {
        /// Target table.
        table: Table,
        /// Row key.
        key: String,
        /// Opaque value bytes.
        value: Vec<u8>,
    },
    /// Remove a value. Deleting a missing key is not an error.
    Delete {
        /// Target table.
        table: Table,
        /// Row key.
        key: String,
    },
}

/// An ordered group of writes committed atomically.
///
/// Later operations on the same key win over earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, table: Table, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put {
            table,
            key: key.into(),
            value,
        });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, table: Table, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table,
            key: key.into(),
        });
        self
    }

    /// Appends all operations of another batch.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    /// Returns the queued operations.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A transactional key/value backend for the sync engine.
///
/// # Invariants
///
/// - `commit` applies every operation of the batch or none of them
/// - After `commit` returns `Ok`, the batch survives process restart
///   (for durable backends)
/// - `get`/`scan` never observe a partially applied batch
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait KvBackend: Send + Sync {
    /// Reads a single value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, table: Table, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Returns every row of a table ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn scan(&self, table: Table) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Atomically applies a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable. In that case
    /// none of its operations are visible.
    fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Returns the number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn count(&self, table: Table) -> StorageResult<usize> {
        Ok(self.scan(table)?.len())
    }
}

/// In-memory table image shared by the backends.
pub(crate) type Tables = BTreeMap<Table, BTreeMap<String, Vec<u8>>>;

/// Applies a batch to an in-memory table image.
pub(crate) fn apply_ops(tables: &mut Tables, ops: &[WriteOp]) {
    for op in ops {
        match op {
            WriteOp::Put { table, key, value } => {
                tables
                    .entry(*table)
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            WriteOp::Delete { table, key } => {
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_ops_win() {
        let mut batch = WriteBatch::new();
        batch
            .put(Table::Entities, "a", vec![1])
            .put(Table::Entities, "a", vec![2])
            .delete(Table::Entities, "b");

        let mut tables = Tables::new();
        apply_ops(&mut tables, batch.ops());
        assert_eq!(tables[&Table::Entities]["a"], vec![2]);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn delete_after_put_removes_row() {
        let mut batch = WriteBatch::new();
        batch.put(Table::Pending, "x", vec![9]).delete(Table::Pending, "x");

        let mut tables = Tables::new();
        apply_ops(&mut tables, batch.ops());
        assert!(tables[&Table::Pending].is_empty());
    }

    #[test]
    fn table_names() {
        let names: Vec<_> = Table::ALL.iter().map(Table::name).collect();
        assert_eq!(names, ["entities", "pending", "conflicts", "meta"]);
    }
}
