//! In-process server for `sync --server loopback`.
//!
//! The server state lives in `server.json` next to the store, so repeated
//! runs see the same server.

use super::CliResult;
use async_trait::async_trait;
use ledgersync_sync_engine::{SyncError, SyncResult, SyncTransport};
use ledgersync_sync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use ledgersync_sync_server::{OplogSnapshot, ServerConfig, ServerError, SyncServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// File name of the persisted loopback server.
pub const SERVER_FILE: &str = "server.json";

/// A sync server persisted as JSON.
pub struct LoopbackServer {
    server: Arc<SyncServer>,
    path: PathBuf,
}

impl LoopbackServer {
    /// Loads the server in `dir`, or starts an empty one.
    pub fn open(dir: &Path) -> CliResult<Self> {
        let path = dir.join(SERVER_FILE);
        let snapshot = if path.exists() {
            serde_json::from_slice::<OplogSnapshot>(&std::fs::read(&path)?)?
        } else {
            OplogSnapshot::default()
        };
        debug!(path = %path.display(), changes = snapshot.log.len(), "loaded loopback server");
        Ok(Self {
            server: Arc::new(SyncServer::from_snapshot(ServerConfig::default(), snapshot)),
            path,
        })
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Returns a transport that calls this server.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            server: Arc::clone(&self.server),
        }
    }

    /// Writes the server state back to disk.
    pub fn save(&self) -> CliResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.server.snapshot())?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Transport that calls an in-process [`SyncServer`].
pub struct LoopbackTransport {
    server: Arc<SyncServer>,
}

fn to_sync_error(err: ServerError) -> SyncError {
    match err {
        ServerError::Unauthorized(message) => SyncError::Auth(message),
        ServerError::InvalidRequest(message) => SyncError::network_fatal(message),
        ServerError::Internal(message) => SyncError::network_retryable(message),
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.server.push(None, request).map_err(to_sync_error)
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.server.pull(None, request).map_err(to_sync_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let loopback = LoopbackServer::open(dir.path()).unwrap();
        loopback
            .server()
            .write("account", "acct-1", Some(json!({"name": "Checking"})));
        loopback.save().unwrap();

        let reopened = LoopbackServer::open(dir.path()).unwrap();
        assert_eq!(reopened.server().cursor(), 1);
        assert!(reopened.server().entity("acct-1").is_some());
    }

    #[test]
    fn server_errors_map_to_sync_errors() {
        assert!(matches!(
            to_sync_error(ServerError::Unauthorized("expired".into())),
            SyncError::Auth(_)
        ));
        assert!(to_sync_error(ServerError::Internal("boom".into())).is_retryable());
        assert!(!to_sync_error(ServerError::InvalidRequest("bad".into())).is_retryable());
    }
}
