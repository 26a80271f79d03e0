//! Resolve command implementation.

use super::{open_queue, open_store, CliResult};
use ledgersync_sync_engine::{MergeRegistry, ResolutionApplier, SystemClock};
use ledgersync_sync_protocol::Resolution;
use std::path::Path;
use std::sync::Arc;

/// Runs the resolve command.
///
/// No merge functions are registered from the command line, so `merge`
/// takes the server side.
pub fn run(path: &Path, conflict_id: &str, resolution: &str) -> CliResult<()> {
    let resolution: Resolution = resolution.parse()?;

    let store = open_store(path)?;
    let queue = open_queue(&store)?;
    let applier = ResolutionApplier::new(
        Arc::clone(&store),
        queue,
        Arc::new(MergeRegistry::new()),
        Arc::new(SystemClock),
    );

    let resolved = applier.resolve(conflict_id, resolution)?;
    println!(
        "Resolved {} {} with {}",
        resolved.entity_type, resolved.entity_id, resolution
    );
    if resolution == Resolution::Local {
        println!("The local data is queued and will be pushed on the next sync");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_conflict_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(dir.path(), "missing", "server").unwrap_err();
        assert!(err.to_string().contains("conflict not found"));
    }

    #[test]
    fn unknown_resolution_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path(), "missing", "theirs").is_err());
    }
}
