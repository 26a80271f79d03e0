//! CLI command implementations.

pub mod compact;
pub mod enqueue;
pub mod inspect;
pub mod loopback;
pub mod resolve;
pub mod sync;

use ledgersync_storage::FileBackend;
use ledgersync_sync_engine::{LocalStore, MutationQueue, RetryConfig, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type of every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// File name of the commit log inside the store directory.
pub const LOG_FILE: &str = "ledgersync.log";

/// Returns the commit log path for a store directory.
pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE)
}

/// Opens the store in `dir`, creating it if needed.
pub fn open_store(dir: &Path) -> CliResult<Arc<LocalStore>> {
    let backend = FileBackend::open_with_create_dirs(&log_path(dir))?;
    Ok(Arc::new(LocalStore::new(Arc::new(backend))))
}

/// Opens the mutation queue over a store.
pub fn open_queue(store: &Arc<LocalStore>) -> CliResult<Arc<MutationQueue>> {
    let queue = MutationQueue::open(
        Arc::clone(store),
        Arc::new(SystemClock),
        RetryConfig::default(),
    )?;
    Ok(Arc::new(queue))
}

/// Formats a Unix-millisecond timestamp for display.
pub fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |at| at.to_rfc3339())
}
