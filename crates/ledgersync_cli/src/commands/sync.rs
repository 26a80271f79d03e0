//! Sync command implementation.

use super::loopback::LoopbackServer;
use super::{log_path, CliResult};
use ledgersync_storage::FileBackend;
use ledgersync_sync_engine::{HttpTransport, SyncConfig, SyncEngine, SyncSummary, SyncTransport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Server argument selecting the in-process loopback server.
pub const LOOPBACK: &str = "loopback";

/// Runs one sync cycle against `server` and prints its summary.
pub async fn run(
    path: &Path,
    server: &str,
    token: Option<&str>,
    timeout_secs: u64,
) -> CliResult<()> {
    let loopback = if server == LOOPBACK {
        Some(LoopbackServer::open(path)?)
    } else {
        None
    };
    let transport: Arc<dyn SyncTransport> = match &loopback {
        Some(loopback) => Arc::new(loopback.transport()),
        None => {
            let http = HttpTransport::new(server)?;
            Arc::new(match token {
                Some(token) => http.with_bearer_token(token),
                None => http,
            })
        }
    };

    let summary = sync_once(path, server, transport, timeout_secs).await;
    if let Some(loopback) = &loopback {
        loopback.save()?;
    }
    let summary = summary?;

    println!("Sync complete");
    println!("  Pushed:     {}", summary.synced);
    println!("  Failed:     {}", summary.failed);
    println!("  Pulled:     {}", summary.pulled);
    println!("  Conflicts:  {}", summary.conflicts);
    Ok(())
}

async fn sync_once(
    path: &Path,
    server: &str,
    transport: Arc<dyn SyncTransport>,
    timeout_secs: u64,
) -> CliResult<SyncSummary> {
    let backend = FileBackend::open_with_create_dirs(&log_path(path))?;
    let config =
        SyncConfig::new(server).with_request_timeout(Duration::from_secs(timeout_secs.max(1)));
    let engine = SyncEngine::builder(Arc::new(backend), transport)
        .config(config)
        .build()?;

    engine.init().await?;
    let result = engine.sync_all().await;
    engine.shutdown().await;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{enqueue, open_store};
    use ledgersync_sync_protocol::Operation;

    #[tokio::test]
    async fn loopback_sync_empties_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        enqueue::run(dir.path(), "account", "acct-1", "create", Some(r#"{"name": "Checking"}"#))
            .unwrap();

        run(dir.path(), LOOPBACK, None, 5).await.unwrap();

        let store = open_store(dir.path()).unwrap();
        assert!(store.pending_changes().unwrap().is_empty());
        let entity = store.entity("acct-1").unwrap().unwrap();
        assert_eq!(entity.server_version, Some(1));

        let server = LoopbackServer::open(dir.path()).unwrap();
        assert_eq!(server.server().cursor(), 1);
    }

    #[tokio::test]
    async fn loopback_conflict_is_stored_locally() {
        let dir = tempfile::tempdir().unwrap();
        enqueue::run(dir.path(), "budget", "b-1", "create", Some(r#"{"amount": 500000}"#)).unwrap();
        run(dir.path(), LOOPBACK, None, 5).await.unwrap();

        let loopback = LoopbackServer::open(dir.path()).unwrap();
        loopback
            .server()
            .write("budget", "b-1", Some(serde_json::json!({"amount": 600000})));
        loopback.save().unwrap();

        enqueue::run(dir.path(), "budget", "b-1", "update", Some(r#"{"amount": 550000}"#)).unwrap();
        run(dir.path(), LOOPBACK, None, 5).await.unwrap();

        let store = open_store(dir.path()).unwrap();
        let conflicts = store.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_change.operation, Operation::Update);
    }
}
