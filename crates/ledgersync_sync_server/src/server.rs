//! The in-process sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use crate::oplog::{OplogSnapshot, ServerEntity, ServerOplog};
use ledgersync_sync_protocol::{
    EntityDelta, PullRequest, PullResponse, PushRequest, PushResponse, Timestamp,
};
use serde_json::Value;
use std::sync::Arc;

/// The sync server.
///
/// Answers push and pull requests against a server-side change log. An
/// HTTP front end maps each endpoint onto [`SyncServer::push`] and
/// [`SyncServer::pull`] and each [`ServerError`] onto its status code.
///
/// # Example
///
/// ```
/// use ledgersync_sync_server::{ServerConfig, SyncServer};
/// use ledgersync_sync_protocol::{Cursor, PullRequest};
///
/// let server = SyncServer::new(ServerConfig::default());
/// let response = server.pull(None, &PullRequest::new(Cursor::default(), 100)).unwrap();
/// assert!(response.changes.is_empty());
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty log.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_oplog(config, Arc::new(ServerOplog::new()))
    }

    /// Creates a sync server with an existing oplog.
    pub fn with_oplog(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, oplog));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Restores a sync server from a snapshot.
    pub fn from_snapshot(config: ServerConfig, snapshot: OplogSnapshot) -> Self {
        Self::with_oplog(config, Arc::new(ServerOplog::from_snapshot(snapshot)))
    }

    /// Handles a push request.
    pub fn push(&self, bearer: Option<&str>, request: &PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(bearer, request, now())
    }

    /// Handles a pull request.
    pub fn pull(&self, bearer: Option<&str>, request: &PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(bearer, request, now())
    }

    /// Issues a bearer token for `subject`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Internal`] if auth is not configured.
    pub fn issue_token(&self, subject: &str) -> ServerResult<String> {
        self.context
            .validator()
            .ok_or_else(|| ServerError::Internal("auth is not configured".into()))?
            .create_token(subject, now())
    }

    /// Writes an entity as another device would. `None` deletes it.
    pub fn write(&self, entity_type: &str, entity_id: &str, payload: Option<Value>) -> EntityDelta {
        self.context
            .oplog
            .write(entity_type, entity_id, payload, now())
    }

    /// Returns the server's copy of an entity.
    pub fn entity(&self, entity_id: &str) -> Option<ServerEntity> {
        self.context.oplog.entity(entity_id)
    }

    /// Returns the current server cursor.
    pub fn cursor(&self) -> u64 {
        self.context.oplog.cursor()
    }

    /// Returns the number of writes in the log.
    pub fn change_count(&self) -> usize {
        self.context.oplog.len()
    }

    /// Returns a copy of the full server state.
    pub fn snapshot(&self) -> OplogSnapshot {
        self.context.oplog.snapshot()
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

fn now() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}
