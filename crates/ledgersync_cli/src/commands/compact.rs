//! Compact command implementation.

use super::{log_path, CliResult};
use ledgersync_storage::{FileBackend, KvBackend, Table};
use std::path::Path;

/// Size of the commit log before and after compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactStats {
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

impl CompactStats {
    /// Bytes reclaimed.
    pub fn saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    let log = log_path(path);
    if !log.exists() {
        return Err(format!("No commit log at {}", log.display()).into());
    }

    let backend = FileBackend::open(&log)?;
    println!("Compacting {}", log.display());
    for table in Table::ALL {
        println!("  {:<10} {} rows", table.name(), backend.count(table)?);
    }

    let bytes_before = backend.log_size();
    if dry_run {
        println!("  Size:      {bytes_before} bytes (dry run, nothing written)");
        return Ok(CompactStats {
            bytes_before,
            bytes_after: bytes_before,
        });
    }

    backend.compact()?;
    let stats = CompactStats {
        bytes_before,
        bytes_after: backend.log_size(),
    };
    println!("  Before:    {} bytes", stats.bytes_before);
    println!("  After:     {} bytes", stats.bytes_after);
    println!("  Saved:     {} bytes", stats.saved());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{enqueue, open_store};

    #[test]
    fn missing_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), false).is_err());
    }

    #[test]
    fn compaction_keeps_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        for amount in 1..=5 {
            let payload = format!(r#"{{"amount": {amount}}}"#);
            enqueue::run(dir.path(), "budget", "b-1", "update", Some(&payload)).unwrap();
        }

        let dry = run(dir.path(), true).unwrap();
        assert_eq!(dry.saved(), 0);

        let stats = run(dir.path(), false).unwrap();
        assert!(stats.bytes_after < stats.bytes_before);

        let pending = open_store(dir.path()).unwrap().pending_changes().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, serde_json::json!({"amount": 5}));
    }
}
