//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use ledgersync_sync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process server, mock for testing, etc.). Timeouts and cancellation
/// are applied by [`crate::RemoteSyncClient`], not by transports.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Pushes pending changes to the server.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls server changes after a cursor.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        (**self).push(request).await
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        (**self).pull(request).await
    }
}

/// A mock transport for testing.
///
/// Scripted responses are consumed in order. With nothing scripted, a push
/// acknowledges every change and a pull returns nothing new.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    push_script: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_script: Mutex<VecDeque<SyncResult<PullResponse>>>,
    pushed: Mutex<Vec<PushRequest>>,
    pulled: Mutex<Vec<PullRequest>>,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues the response to the next unscripted push.
    pub fn push_response(&self, response: PushResponse) {
        self.push_script.lock().push_back(Ok(response));
    }

    /// Queues a failure for the next unscripted push.
    pub fn push_error(&self, error: SyncError) {
        self.push_script.lock().push_back(Err(error));
    }

    /// Queues the response to the next unscripted pull.
    pub fn pull_response(&self, response: PullResponse) {
        self.pull_script.lock().push_back(Ok(response));
    }

    /// Queues a failure for the next unscripted pull.
    pub fn pull_error(&self, error: SyncError) {
        self.pull_script.lock().push_back(Err(error));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Sets the connected state. A disconnected mock fails every call with
    /// a retryable network error.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the number of push calls made.
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of pull calls made.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Returns every push request received.
    pub fn pushed(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }

    /// Returns every pull request received.
    pub fn pulled(&self) -> Vec<PullRequest> {
        self.pulled.lock().clone()
    }

    async fn simulate(&self) -> SyncResult<()> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::network_retryable("mock transport disconnected"));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.pushed.lock().push(request.clone());
        self.simulate().await?;

        let scripted = self.push_script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PushResponse::acked(
                request.changes.iter().map(|change| change.entity_id.clone()),
            ))
        })
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.pulled.lock().push(request.clone());
        self.simulate().await?;

        let scripted = self.pull_script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(PullResponse {
                changes: Vec::new(),
                new_cursor: request.since.clone(),
                has_more: false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_sync_protocol::{Cursor, Operation, PendingChange};
    use serde_json::json;

    fn request() -> PushRequest {
        let change = PendingChange::new("a", "account", Operation::Create, json!({}), 1, None, 0);
        PushRequest::new(vec![change.to_push()])
    }

    #[tokio::test]
    async fn default_push_acks_everything() {
        let transport = MockTransport::new();
        let response = transport.push(&request()).await.unwrap();
        assert_eq!(response.acked, vec!["a".to_string()]);
        assert_eq!(transport.push_calls(), 1);
        assert_eq!(transport.pushed().len(), 1);
    }

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport.pull_error(SyncError::Timeout);
        let since = Cursor::from_sequence(3);

        let first = transport.pull(&PullRequest::new(since.clone(), 10)).await;
        assert!(matches!(first, Err(SyncError::Timeout)));

        let second = transport.pull(&PullRequest::new(since.clone(), 10)).await.unwrap();
        assert_eq!(second.new_cursor, since);
        assert_eq!(transport.pull_calls(), 2);
    }

    #[tokio::test]
    async fn disconnected_mock_fails_retryably() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let err = transport.push(&request()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
