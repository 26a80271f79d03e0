//! Test fixtures: finance payloads and on-disk stores.

use ledgersync_storage::{FileBackend, StorageResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Entity type of bank and card accounts.
pub const ACCOUNT: &str = "account";
/// Entity type of ledger transactions.
pub const TRANSACTION: &str = "transaction";
/// Entity type of category budgets.
pub const BUDGET: &str = "budget";

/// An account payload. Amounts are integer minor units.
pub fn account(name: &str, balance: i64) -> Value {
    json!({
        "name": name,
        "balance": balance,
        "currency": "USD",
    })
}

/// A transaction payload against an account.
pub fn transaction(account_id: &str, amount: i64, memo: &str) -> Value {
    json!({
        "accountId": account_id,
        "amount": amount,
        "memo": memo,
    })
}

/// A monthly budget payload for a category.
pub fn budget(category: &str, amount: i64) -> Value {
    json!({
        "category": category,
        "amount": amount,
        "period": "monthly",
    })
}

/// A small ledger: one account, two transactions and one budget.
///
/// Each item is `(entity_type, entity_id, payload)`.
pub fn sample_ledger() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        (ACCOUNT, "acct-checking", account("Checking", 250_000)),
        (
            TRANSACTION,
            "txn-rent",
            transaction("acct-checking", -120_000, "Rent"),
        ),
        (
            TRANSACTION,
            "txn-coffee",
            transaction("acct-checking", -450, "Coffee"),
        ),
        (BUDGET, "budget-food", budget("food", 500_000)),
    ]
}

/// A commit log in a temporary directory, removed on drop.
///
/// Reopening replays the same file, which is how tests simulate a restart.
pub struct TempLog {
    dir: TempDir,
    path: PathBuf,
}

impl TempLog {
    /// Creates an empty temporary directory for a commit log.
    pub fn new() -> std::io::Result<Self> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ledgersync.log");
        Ok(Self { dir, path })
    }

    /// Opens (or reopens) the backend.
    pub fn open(&self) -> StorageResult<FileBackend> {
        FileBackend::open(&self.path)
    }

    /// Path of the commit log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The temporary directory holding the log.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_storage::{KvBackend, Table, WriteBatch};

    #[test]
    fn payloads_are_objects() {
        for (_, _, payload) in sample_ledger() {
            assert!(payload.is_object());
        }
        assert_eq!(budget("food", 1)["amount"], 1);
    }

    #[test]
    fn temp_log_survives_reopen() {
        let log = TempLog::new().unwrap();
        {
            let backend = log.open().unwrap();
            let mut batch = WriteBatch::new();
            batch.put(Table::Meta, "cursor", b"7".to_vec());
            backend.commit(batch).unwrap();
        }
        let backend = log.open().unwrap();
        assert_eq!(backend.get(Table::Meta, "cursor").unwrap(), Some(b"7".to_vec()));
        assert!(log.path().starts_with(log.dir()));
    }
}
