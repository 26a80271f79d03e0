//! Timeout- and cancellation-aware wrapper over a [`SyncTransport`].

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use ledgersync_sync_protocol::{
    Cursor, EntityDelta, MalformedChange, PendingChange, PullRequest, PushRequest, PushResponse,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One validated page of server changes.
#[derive(Debug, Clone, Default)]
pub struct PullPage {
    /// Changes that decoded and validated.
    pub deltas: Vec<EntityDelta>,
    /// Changes that were refused.
    pub malformed: Vec<MalformedChange>,
    /// Cursor for the next pull.
    pub new_cursor: Cursor,
    /// True if the server has more changes after `new_cursor`.
    pub has_more: bool,
}

/// Client side of the remote sync contract.
///
/// Every call is bounded by the request timeout and aborted when the given
/// cancellation token fires. A timeout surfaces as [`SyncError::Timeout`],
/// which is retryable.
#[derive(Clone)]
pub struct RemoteSyncClient {
    transport: Arc<dyn SyncTransport>,
    timeout: Duration,
}

impl RemoteSyncClient {
    /// Creates a client.
    pub fn new(transport: Arc<dyn SyncTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Pushes a batch of pending changes.
    ///
    /// Response entries naming entities outside the batch are dropped.
    pub async fn push(
        &self,
        batch: &[PendingChange],
        cancel: &CancellationToken,
    ) -> SyncResult<PushResponse> {
        let request = PushRequest::new(batch.iter().map(PendingChange::to_push).collect());
        let mut response = self
            .bounded(cancel, self.transport.push(&request))
            .await?;

        let sent: HashSet<&str> = batch.iter().map(|change| change.entity_id.as_str()).collect();
        let before = response.acked.len() + response.conflicts.len() + response.rejected.len();
        response.acked.retain(|id| sent.contains(id.as_str()));
        response
            .conflicts
            .retain(|conflict| sent.contains(conflict.entity_id.as_str()));
        response
            .rejected
            .retain(|rejected| sent.contains(rejected.entity_id.as_str()));
        let acked: HashSet<&str> = response.acked.iter().map(String::as_str).collect();
        response
            .acked_versions
            .retain(|id, _| acked.contains(id.as_str()));
        let after = response.acked.len() + response.conflicts.len() + response.rejected.len();
        if after != before {
            warn!(dropped = before - after, "push response named entities outside the batch");
        }

        debug!(
            sent = batch.len(),
            acked = response.acked.len(),
            conflicts = response.conflicts.len(),
            rejected = response.rejected.len(),
            "push complete"
        );
        Ok(response)
    }

    /// Pulls one page of server changes after `since`.
    ///
    /// Each change is validated on its own; a malformed change is reported
    /// in [`PullPage::malformed`] and does not fail the page.
    pub async fn pull(
        &self,
        since: &Cursor,
        limit: u32,
        cancel: &CancellationToken,
    ) -> SyncResult<PullPage> {
        let request = PullRequest::new(since.clone(), limit);
        let response = self
            .bounded(cancel, self.transport.pull(&request))
            .await?;

        let (deltas, malformed) = response.decode_changes();
        for item in &malformed {
            warn!(entity_id = ?item.entity_id, reason = %item.reason, "skipping malformed server change");
        }
        debug!(
            since = %since,
            received = deltas.len(),
            malformed = malformed.len(),
            has_more = response.has_more,
            "pull page complete"
        );

        Ok(PullPage {
            deltas,
            malformed,
            new_cursor: response.new_cursor,
            has_more: response.has_more,
        })
    }

    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => {
                outcome.map_err(|_| SyncError::Timeout)?
            }
        }
    }
}

impl std::fmt::Debug for RemoteSyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSyncClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
