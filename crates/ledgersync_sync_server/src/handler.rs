//! Request handlers for the push and pull endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::oplog::{ApplyOutcome, ServerOplog};
use ledgersync_sync_protocol::{
    Cursor, PullRequest, PullResponse, PushRequest, PushResponse, RejectedChange, Timestamp,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Context shared by request handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server oplog.
    pub oplog: Arc<ServerOplog>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, oplog: Arc<ServerOplog>) -> Self {
        let validator = config.auth_secret.as_ref().map(|secret| {
            TokenValidator::new(
                AuthConfig::new(secret.clone()).with_expiry(config.token_expiry),
            )
        });
        Self {
            config,
            oplog,
            validator,
        }
    }

    /// Returns the token validator, if auth is configured.
    pub fn validator(&self) -> Option<&TokenValidator> {
        self.validator.as_ref()
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Checks the bearer token when auth is required.
    pub fn authorize(&self, bearer: Option<&str>, now: Timestamp) -> ServerResult<()> {
        if !self.context.config.require_auth {
            return Ok(());
        }
        let validator = self
            .context
            .validator()
            .ok_or_else(|| ServerError::Internal("auth required but no secret set".into()))?;
        let token = bearer.ok_or_else(|| ServerError::Unauthorized("missing token".into()))?;
        validator.validate_token(token, now).map(|subject| {
            debug!(subject = %subject, "request authorized");
        })
    }

    /// Handles a push request.
    ///
    /// Every change is applied independently. A retried change whose
    /// idempotency key was already applied is acknowledged again.
    pub fn handle_push(
        &self,
        bearer: Option<&str>,
        request: &PushRequest,
        now: Timestamp,
    ) -> ServerResult<PushResponse> {
        self.authorize(bearer, now)?;

        let max = self.context.config.max_push_batch as usize;
        if request.changes.len() > max {
            return Err(ServerError::InvalidRequest(format!(
                "push batch of {} exceeds limit of {max}",
                request.changes.len()
            )));
        }

        let mut response = PushResponse::default();
        for change in &request.changes {
            match self.context.oplog.apply(change, now) {
                ApplyOutcome::Applied { version, .. } | ApplyOutcome::Duplicate { version } => {
                    response.ack(change.entity_id.clone(), version);
                }
                ApplyOutcome::Conflict(conflict) => response.conflicts.push(conflict),
                ApplyOutcome::Rejected(reason) => {
                    warn!(entity_id = %change.entity_id, %reason, "rejected pushed change");
                    response.rejected.push(RejectedChange {
                        entity_id: change.entity_id.clone(),
                        reason,
                    });
                }
            }
        }

        debug!(
            acked = response.acked.len(),
            conflicts = response.conflicts.len(),
            rejected = response.rejected.len(),
            "handled push"
        );
        Ok(response)
    }

    /// Handles a pull request.
    ///
    /// The limit is clamped to `1..=max_pull_batch`.
    pub fn handle_pull(
        &self,
        bearer: Option<&str>,
        request: &PullRequest,
        now: Timestamp,
    ) -> ServerResult<PullResponse> {
        self.authorize(bearer, now)?;

        let since = if request.since.is_initial() {
            0
        } else {
            request.since.as_sequence().ok_or_else(|| {
                ServerError::InvalidRequest(format!("invalid cursor: {}", request.since.as_str()))
            })?
        };
        let limit = request.limit.clamp(1, self.context.config.max_pull_batch) as usize;

        let (deltas, new_cursor, has_more) = self.context.oplog.changes_since(since, limit);
        debug!(since, returned = deltas.len(), has_more, "handled pull");

        PullResponse::from_deltas(&deltas, Cursor::from_sequence(new_cursor), has_more)
            .map_err(|err| ServerError::Internal(err.to_string()))
    }
}
