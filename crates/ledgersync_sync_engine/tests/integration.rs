//! Integration tests for the sync engine against the in-process server.

use async_trait::async_trait;
use ledgersync_storage::{InMemoryBackend, KvBackend, Table};
use ledgersync_sync_engine::{
    NetworkMonitor, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncResult, SyncStatus,
    SyncTransport,
};
use ledgersync_sync_protocol::{
    Cursor, Operation, PullRequest, PullResponse, PushRequest, PushResponse, Resolution,
};
use ledgersync_sync_server::{ServerConfig, ServerError, SyncServer};
use ledgersync_testkit::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A transport that calls an in-process server.
struct LoopbackTransport {
    server: Arc<SyncServer>,
    token: Option<String>,
    latency: Option<Duration>,
    reply_delay: Option<Duration>,
    failing_pulls: AtomicUsize,
    push_calls: AtomicUsize,
}

impl LoopbackTransport {
    fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            token: None,
            latency: None,
            reply_delay: None,
            failing_pulls: AtomicUsize::new(0),
            push_calls: AtomicUsize::new(0),
        }
    }

    fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delays push responses after the server has applied the push.
    fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    /// Fails the next `count` pulls with a retryable error.
    fn failing_pulls(self, count: usize) -> Self {
        self.failing_pulls.store(count, Ordering::SeqCst);
        self
    }

    fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn map_server_error(err: ServerError) -> SyncError {
    match err {
        ServerError::Unauthorized(message) => SyncError::Auth(message),
        ServerError::InvalidRequest(message) => SyncError::network_fatal(message),
        ServerError::Internal(message) => SyncError::network_retryable(message),
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        let response = self
            .server
            .push(self.token.as_deref(), request)
            .map_err(map_server_error);
        if let Some(delay) = self.reply_delay {
            tokio::time::sleep(delay).await;
        }
        response
    }

    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.delay().await;
        let fail = self
            .failing_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SyncError::network_retryable("connection reset"));
        }
        self.server
            .pull(self.token.as_deref(), request)
            .map_err(map_server_error)
    }
}

struct Setup {
    engine: SyncEngine,
    server: Arc<SyncServer>,
    transport: Arc<LoopbackTransport>,
    network: Arc<NetworkMonitor>,
}

fn config() -> SyncConfig {
    SyncConfig::new("loopback://")
        .with_retry(RetryConfig::new(3).with_jitter(false))
        .with_request_timeout(Duration::from_secs(5))
}

async fn setup_with(
    backend: Arc<dyn KvBackend>,
    server: Arc<SyncServer>,
    transport: LoopbackTransport,
    online: bool,
) -> Setup {
    let transport = Arc::new(transport);
    let network = Arc::new(NetworkMonitor::new(online));
    let engine = SyncEngine::builder(backend, transport.clone())
        .config(config())
        .network(Arc::clone(&network))
        .build()
        .unwrap();
    engine.init().await.unwrap();
    Setup {
        engine,
        server,
        transport,
        network,
    }
}

async fn setup() -> Setup {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport = LoopbackTransport::new(Arc::clone(&server));
    setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await
}

fn food_budget(amount: i64, alert_threshold: u32) -> serde_json::Value {
    let mut payload = budget("food", amount);
    payload["alertThreshold"] = json!(alert_threshold);
    payload
}

/// Brings the budget into conflict: the server moved from 500000 to
/// 600000 and raised the alert threshold from 80 to 90 while this device
/// edited the amount to 550000.
async fn budget_conflict(s: &Setup) {
    s.server
        .write(BUDGET, "budget-food", Some(food_budget(500_000, 80)));
    s.engine.sync_all().await.unwrap();

    s.server
        .write(BUDGET, "budget-food", Some(food_budget(600_000, 90)));
    s.engine
        .enqueue(BUDGET, "budget-food", Operation::Update, json!({"amount": 550_000}))
        .unwrap();

    let summary = s.engine.sync_all().await.unwrap();
    assert_eq!(summary.synced, 0);
    assert_eq!(s.engine.list_conflicts().unwrap().len(), 1);
}

async fn wait_for_status(
    engine: &SyncEngine,
    predicate: impl FnMut(&SyncStatus) -> bool,
) -> SyncStatus {
    let mut watch = engine.watch_status();
    let status = tokio::time::timeout(Duration::from_secs(5), watch.wait_for(predicate))
        .await
        .expect("status never matched")
        .expect("engine dropped")
        .clone();
    status
}

#[tokio::test]
async fn queued_writes_sync_when_connectivity_returns() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport = LoopbackTransport::new(Arc::clone(&server));
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, false).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 1_000))
        .unwrap();
    s.engine
        .enqueue(TRANSACTION, "txn-1", Operation::Update, transaction("acct-1", -200, "Lunch"))
        .unwrap();
    s.engine
        .enqueue(TRANSACTION, "txn-2", Operation::Update, transaction("acct-1", -50, "Bus"))
        .unwrap();

    let offline = s.engine.get_status();
    assert!(!offline.is_online);
    assert_eq!(offline.pending_count, 3);
    assert_eq!(offline.pending_by_type.get(TRANSACTION), Some(&2));
    assert_eq!(s.transport.push_calls(), 0);

    s.network.set_online(true);
    let synced = wait_for_status(&s.engine, |status| {
        status.pending_count == 0 && !status.is_syncing && status.last_sync_time.is_some()
    })
    .await;

    assert!(synced.is_online);
    assert_eq!(synced.last_error, None);
    assert_eq!(s.server.change_count(), 3);
    assert_eq!(
        s.server.entity("txn-1").unwrap().payload,
        transaction("acct-1", -200, "Lunch")
    );
    s.engine.shutdown().await;
}

#[tokio::test]
async fn pulled_entities_learn_their_server_version() {
    let s = setup().await;
    for (entity_type, id, payload) in sample_ledger() {
        s.server.write(entity_type, id, Some(payload));
    }

    let summary = s.engine.sync_all().await.unwrap();
    assert_eq!(summary.pulled, 4);

    let rent = s.engine.store().entity("txn-rent").unwrap().unwrap();
    assert_eq!(rent.server_version, Some(1));
    assert_eq!(rent.payload, transaction("acct-checking", -120_000, "Rent"));

    s.engine
        .enqueue(TRANSACTION, "txn-rent", Operation::Update, json!({"memo": "April rent"}))
        .unwrap();
    let pending = s.engine.queue().get("txn-rent").unwrap().unwrap();
    assert_eq!(pending.base_version, Some(1));

    s.engine.sync_all().await.unwrap();
    assert!(s.engine.queue().is_empty().unwrap());
    let server_copy = s.server.entity("txn-rent").unwrap();
    assert_eq!(server_copy.version, 2);
    assert_eq!(server_copy.payload["memo"], "April rent");
    assert_eq!(server_copy.payload["amount"], -120_000);
}

#[tokio::test]
async fn server_resolution_takes_the_server_amount() {
    let s = setup().await;
    budget_conflict(&s).await;

    let conflict = s.engine.list_conflicts().unwrap().remove(0);
    assert_eq!(conflict.entity_id, "budget-food");
    assert_eq!(conflict.local_change.data["amount"], 550_000);
    assert_eq!(conflict.server_change.data["amount"], 600_000);
    assert_eq!(conflict.local_change.data["alertThreshold"], 80);
    assert_eq!(conflict.server_change.data["alertThreshold"], 90);
    assert_eq!(
        conflict.changed_fields(),
        vec!["alertThreshold".to_string(), "amount".to_string()]
    );

    s.engine
        .resolve_conflict(&conflict.id, Resolution::Server)
        .await
        .unwrap();

    let entity = s.engine.store().entity("budget-food").unwrap().unwrap();
    assert_eq!(entity.payload, food_budget(600_000, 90));
    assert_eq!(entity.server_version, Some(2));
    assert!(s.engine.queue().get("budget-food").unwrap().is_none());

    let status = s.engine.get_status();
    assert_eq!(status.conflict_count, 0);
    assert_eq!(status.pending_count, 0);

    s.engine.sync_all().await.unwrap();
    assert_eq!(s.server.entity("budget-food").unwrap().payload["amount"], 600_000);
}

#[tokio::test]
async fn local_resolution_pushes_the_local_amount() {
    let s = setup().await;
    budget_conflict(&s).await;

    let conflict = s.engine.list_conflicts().unwrap().remove(0);
    s.engine
        .resolve_conflict(&conflict.id, Resolution::Local)
        .await
        .unwrap();

    let pending = s.engine.queue().get("budget-food").unwrap().unwrap();
    assert_eq!(pending.payload["amount"], 550_000);
    assert_eq!(pending.base_version, Some(2));
    assert_eq!(s.engine.get_status().conflict_count, 0);

    let summary = s.engine.sync_all().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(s.server.entity("budget-food").unwrap().payload["amount"], 550_000);
    assert_eq!(
        s.engine
            .store()
            .entity("budget-food")
            .unwrap()
            .unwrap()
            .server_version,
        Some(3)
    );
}

#[tokio::test]
async fn second_resolution_is_not_found() {
    let s = setup().await;
    budget_conflict(&s).await;

    let id = s.engine.list_conflicts().unwrap().remove(0).id;
    s.engine.resolve_conflict(&id, Resolution::Server).await.unwrap();
    assert!(matches!(
        s.engine.resolve_conflict(&id, Resolution::Local).await,
        Err(SyncError::ConflictNotFound(_))
    ));
}

#[tokio::test]
async fn repeated_divergence_keeps_one_conflict_per_entity() {
    let s = setup().await;
    budget_conflict(&s).await;

    s.server
        .write(BUDGET, "budget-food", Some(budget("food", 700_000)));
    s.engine
        .enqueue(BUDGET, "budget-food", Operation::Update, json!({"amount": 560_000}))
        .unwrap();
    s.engine.sync_all().await.unwrap();

    let conflicts = s.engine.list_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_change.data["amount"], 560_000);
    assert_eq!(conflicts[0].server_change.data["amount"], 700_000);
    assert_eq!(s.engine.get_status().conflict_count, 1);
}

#[tokio::test]
async fn concurrent_sync_calls_share_one_push() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport =
        LoopbackTransport::new(Arc::clone(&server)).with_latency(Duration::from_millis(50));
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Savings", 0))
        .unwrap();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    let _subscription = s.engine.subscribe(move |status| {
        let mut seen = sink.lock();
        if seen.last() != Some(&status.is_syncing) {
            seen.push(status.is_syncing);
        }
    });
    let watch = s.engine.watch_status();

    let sample = async {
        let mut samples = Vec::new();
        // During the push, then during the pull.
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            samples.push((s.engine.get_status().is_syncing, watch.borrow().is_syncing));
        }
        samples
    };
    let (first, second, samples) = tokio::join!(s.engine.sync_all(), s.engine.sync_all(), sample);
    assert_eq!(first.unwrap().synced, 1);
    assert_eq!(second.unwrap().synced, 1);
    assert_eq!(samples, vec![(true, true), (true, true)]);
    assert_eq!(*transitions.lock(), vec![true, false]);
    assert!(!s.engine.get_status().is_syncing);
    assert_eq!(s.transport.push_calls(), 1);
    assert_eq!(s.server.change_count(), 1);
}

#[tokio::test]
async fn acked_push_is_versioned_even_when_the_pull_fails() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport = LoopbackTransport::new(Arc::clone(&server)).failing_pulls(1);
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 0))
        .unwrap();
    let err = s.engine.sync_all().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(s.engine.queue().is_empty().unwrap());
    let entity = s.engine.store().entity("acct-1").unwrap().unwrap();
    assert_eq!(entity.server_version, Some(1));

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Update, json!({"name": "Main"}))
        .unwrap();
    let pending = s.engine.queue().get("acct-1").unwrap().unwrap();
    assert_eq!(pending.base_version, Some(1));

    let summary = s.engine.sync_all().await.unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(summary.conflicts, 0);
    assert!(s.engine.list_conflicts().unwrap().is_empty());
    assert_eq!(s.server.entity("acct-1").unwrap().payload["name"], "Main");
}

#[tokio::test]
async fn delete_during_create_push_reaches_the_server() {
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport =
        LoopbackTransport::new(Arc::clone(&server)).with_reply_delay(Duration::from_millis(50));
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 0))
        .unwrap();
    let engine = s.engine.clone();
    let flight = tokio::spawn(async move { engine.sync_all().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    // The server already holds the create; only its reply is outstanding.
    assert!(s.server.entity("acct-1").is_some());

    let change = s
        .engine
        .enqueue(ACCOUNT, "acct-1", Operation::Delete, serde_json::Value::Null)
        .unwrap()
        .unwrap();
    assert_eq!(change.operation, Operation::Delete);

    flight.await.unwrap().unwrap();
    let pending = s.engine.queue().get("acct-1").unwrap().unwrap();
    assert_eq!(pending.operation, Operation::Delete);
    assert_eq!(pending.base_version, Some(1));

    s.engine.sync_all().await.unwrap();
    assert!(s.engine.queue().is_empty().unwrap());
    assert!(s.server.entity("acct-1").unwrap().is_deleted());
    assert!(s.engine.store().entity("acct-1").unwrap().is_none());
    assert!(s.engine.list_conflicts().unwrap().is_empty());
}

#[tokio::test]
async fn empty_sync_only_toggles_syncing() {
    let s = setup().await;
    let before = s.engine.get_status();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = s.engine.subscribe(move |status| sink.lock().push(status.clone()));

    let summary = s.engine.sync_all().await.unwrap();
    assert!(!summary.transferred());
    assert_eq!(s.transport.push_calls(), 0);

    let seen = seen.lock().clone();
    assert!(!seen.is_empty());
    for status in &seen {
        let mut normalized = status.clone();
        normalized.is_syncing = before.is_syncing;
        assert_eq!(normalized, before);
    }
    assert_eq!(s.engine.get_status(), before);
}

#[tokio::test]
async fn refused_credentials_keep_the_queue_untouched() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::new().with_auth(b"server-secret".to_vec()),
    ));
    let transport = LoopbackTransport::new(Arc::clone(&server)).with_token("forged.0.00");
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 0))
        .unwrap();
    assert!(matches!(s.engine.sync_all().await, Err(SyncError::Auth(_))));

    let pending = s.engine.queue().get("acct-1").unwrap().unwrap();
    assert_eq!(pending.attempts, 0);
    let status = s.engine.get_status();
    assert_eq!(status.pending_count, 1);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn valid_token_is_accepted() {
    let server = Arc::new(SyncServer::new(
        ServerConfig::new().with_auth(b"server-secret".to_vec()),
    ));
    let token = server.issue_token("device-1").unwrap();
    let transport = LoopbackTransport::new(Arc::clone(&server)).with_token(token);
    let s = setup_with(Arc::new(InMemoryBackend::new()), server, transport, true).await;

    s.engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 0))
        .unwrap();
    assert_eq!(s.engine.sync_all().await.unwrap().synced, 1);
}

#[tokio::test]
async fn failed_resolution_commit_changes_nothing() {
    let backend = Arc::new(FaultyBackend::new(InMemoryBackend::new()));
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport = LoopbackTransport::new(Arc::clone(&server));
    let s = setup_with(backend.clone(), server, transport, true).await;
    budget_conflict(&s).await;

    let conflict = s.engine.list_conflicts().unwrap().remove(0);
    let entity_before = s.engine.store().entity("budget-food").unwrap();
    let pending_before = s.engine.queue().get("budget-food").unwrap();

    backend.fail_next_commits(1);
    let result = s
        .engine
        .resolve_conflict(&conflict.id, Resolution::Server)
        .await;
    assert!(matches!(result, Err(SyncError::Storage(_))));

    assert_eq!(s.engine.list_conflicts().unwrap(), vec![conflict.clone()]);
    assert_eq!(s.engine.store().entity("budget-food").unwrap(), entity_before);
    assert_eq!(s.engine.queue().get("budget-food").unwrap(), pending_before);
    assert_eq!(s.engine.get_status().conflict_count, 1);

    s.engine
        .resolve_conflict(&conflict.id, Resolution::Server)
        .await
        .unwrap();
    assert!(s.engine.list_conflicts().unwrap().is_empty());
}

#[tokio::test]
async fn failed_enqueue_commit_leaves_the_queue_unchanged() {
    let backend = Arc::new(FaultyBackend::new(InMemoryBackend::new()));
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let transport = LoopbackTransport::new(Arc::clone(&server));
    let s = setup_with(backend.clone(), server, transport, false).await;

    backend.fail_on_table(Table::Pending);
    let result = s
        .engine
        .enqueue(ACCOUNT, "acct-1", Operation::Create, account("Checking", 0));
    assert!(matches!(result, Err(SyncError::Storage(_))));
    assert!(s.engine.store().entity("acct-1").unwrap().is_none());
    assert_eq!(s.engine.get_status().pending_count, 0);
}

#[tokio::test]
async fn queue_and_cursor_survive_restart() {
    let log = TempLog::new().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    server.write(ACCOUNT, "acct-remote", Some(account("Brokerage", 10)));

    {
        let transport = LoopbackTransport::new(Arc::clone(&server));
        let s = setup_with(Arc::new(log.open().unwrap()), Arc::clone(&server), transport, true)
            .await;
        s.engine.sync_all().await.unwrap();
        s.network.set_online(false);
        s.engine
            .enqueue(BUDGET, "budget-food", Operation::Create, budget("food", 500_000))
            .unwrap();
        s.engine
            .enqueue(TRANSACTION, "txn-1", Operation::Create, transaction("acct-remote", 5, "Refund"))
            .unwrap();
        s.engine.shutdown().await;
    }
    server.write(ACCOUNT, "acct-savings", Some(account("Savings", 0)));

    let transport = LoopbackTransport::new(Arc::clone(&server));
    let s = setup_with(Arc::new(log.open().unwrap()), Arc::clone(&server), transport, true).await;

    let status = s.engine.get_status();
    assert_eq!(status.pending_count, 2);
    assert!(status.last_sync_time.is_some());
    assert!(s.engine.store().entity("acct-remote").unwrap().is_some());
    let cursor: Option<Cursor> = s.engine.store().meta("cursor").unwrap();
    assert_eq!(cursor, Some(Cursor::from_sequence(1)));

    let summary = s.engine.sync_all().await.unwrap();
    assert_eq!(summary.synced, 2);
    // The pushed changes come back already acknowledged; only the new
    // server write is applied.
    assert_eq!(summary.pulled, 1);
    assert!(s.engine.store().entity("acct-savings").unwrap().is_some());
    assert_eq!(s.server.change_count(), 4);
    s.engine.shutdown().await;
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn local_and_server_converge(writes in write_sequence_strategy(4, 1, 24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let s = setup().await;
            for write in &writes {
                s.engine
                    .enqueue(write.entity_type, &write.entity_id, write.operation, write.payload.clone())
                    .unwrap();
            }

            s.engine.sync_all().await.unwrap();
            assert!(s.engine.queue().is_empty().unwrap());
            assert!(s.engine.list_conflicts().unwrap().is_empty());

            for n in 0..4 {
                let id = format!("entity-{n}");
                let local = s.engine.store().entity(&id).unwrap().map(|e| e.payload);
                let remote = s
                    .server
                    .entity(&id)
                    .filter(|e| !e.is_deleted())
                    .map(|e| e.payload);
                assert_eq!(local, remote, "entity {id} diverged");
            }
            s.engine.shutdown().await;
        });
    }
}
