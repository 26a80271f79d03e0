//! The sync orchestrator.
//!
//! [`SyncEngine`] owns every engine component and runs sync cycles:
//!
//! ```text
//! Idle -> Checking -> Pushing -> Pulling -> Reconciling -> Idle
//!            |           |          |            |
//!            +-----------+----------+------------+--> Error
//! ```
//!
//! Only one flight runs at a time. A flight is one cycle plus at most one
//! immediate re-run when local writes arrived while a caller was waiting.

use crate::client::{PullPage, RemoteSyncClient};
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::conflicts::{upsert_in, ConflictStore};
use crate::detector::{ConflictDetector, Reconcile};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::listeners::Subscription;
use crate::network::{LifecycleSignal, NetworkMonitor};
use crate::queue::{flag_in, MutationQueue};
use crate::resolution::{MergeRegistry, ResolutionApplier};
use crate::state::{SyncState, SyncSummary, SyncTrigger};
use crate::status::{StatusAggregator, SyncStatus};
use crate::store::{LocalStore, StoreTxn, CURSOR_KEY, LAST_SYNC_KEY};
use crate::transport::SyncTransport;
use ledgersync_storage::KvBackend;
use ledgersync_sync_protocol::{
    Cursor, Entity, EntityDelta, Operation, PendingChange, PushResponse, Resolution,
    SyncConflict, Timestamp, Version,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Payloads this cycle pushed and the server acknowledged, by entity ID.
type Echoes = HashMap<String, Value>;

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    backend: Arc<dyn KvBackend>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    clock: Option<Arc<dyn Clock>>,
    network: Option<Arc<NetworkMonitor>>,
    merges: Option<Arc<MergeRegistry>>,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the wall clock. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Shares a network monitor fed by the platform. Defaults to a monitor
    /// that starts online.
    pub fn network(mut self, network: Arc<NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    /// Shares a merge registry.
    pub fn merges(mut self, merges: Arc<MergeRegistry>) -> Self {
        self.merges = Some(merges);
        self
    }

    /// Opens the store and rebuilds status counts from it.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the persisted tables cannot be read.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let network = self.network.unwrap_or_default();
        let merges = self.merges.unwrap_or_default();

        let store = Arc::new(LocalStore::new(self.backend));
        let queue = Arc::new(MutationQueue::open(
            Arc::clone(&store),
            Arc::clone(&clock),
            self.config.retry.clone(),
        )?);
        let status = Arc::new(StatusAggregator::new(network.is_online()));
        status.rehydrate(&store)?;

        let subscriptions = vec![
            {
                let status = Arc::clone(&status);
                store.subscribe(move |delta| status.apply_delta(delta))
            },
            {
                let status = Arc::clone(&status);
                network.subscribe(move |signal| match signal {
                    LifecycleSignal::Online => status.set_online(true),
                    LifecycleSignal::Offline => status.set_online(false),
                    LifecycleSignal::Focus => {}
                })
            },
        ];

        let applier = ResolutionApplier::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            merges,
            Arc::clone(&clock),
        );
        let client = RemoteSyncClient::new(self.transport, self.config.request_timeout);
        let (triggers, receiver) = mpsc::unbounded_channel();
        let (finished, _) = watch::channel(FlightReport::default());
        let shutdown = CancellationToken::new();

        let rehydrated = status.snapshot();
        debug!(
            pending = rehydrated.pending_count,
            conflicts = rehydrated.conflict_count,
            "sync engine rehydrated"
        );

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                conflicts: ConflictStore::new(Arc::clone(&store)),
                config: self.config,
                store,
                queue,
                applier,
                network,
                client,
                status,
                clock,
                state: RwLock::new(SyncState::Idle),
                flight: Mutex::new(Flight::default()),
                finished,
                cycle_cancel: Mutex::new(shutdown.child_token()),
                shutdown,
                consecutive_failures: AtomicU32::new(0),
                retry_epoch: Arc::new(AtomicU64::new(0)),
                triggers,
                receiver: Mutex::new(Some(receiver)),
                worker: Mutex::new(None),
                subscriptions: Mutex::new(subscriptions),
                initialized: AtomicBool::new(false),
            }),
        })
    }
}

/// Offline-first sync engine.
///
/// Domain code records every local write with [`SyncEngine::enqueue`]; the
/// engine pushes queued changes, pulls server changes, applies clean ones
/// and stores divergent ones as conflicts for the user to resolve.
///
/// ```ignore
/// let engine = SyncEngine::builder(backend, transport)
///     .config(SyncConfig::new("https://sync.example.com"))
///     .build()?;
/// engine.init().await?;
/// engine.enqueue("account", "acct-1", Operation::Create, json!({"name": "Checking"}))?;
/// let summary = engine.sync_all().await?;
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Starts building an engine over a storage backend and a transport.
    pub fn builder(
        backend: Arc<dyn KvBackend>,
        transport: Arc<dyn SyncTransport>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            backend,
            transport,
            config: SyncConfig::default(),
            clock: None,
            network: None,
            merges: None,
        }
    }

    /// Starts the background trigger loop: interval timer, online and focus
    /// signals, and retry backoff. Calling it again has no effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn init(&self) -> SyncResult<()> {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(receiver) = inner.receiver.lock().take() else {
            return Ok(());
        };

        let triggers = inner.triggers.clone();
        let subscription = inner.network.subscribe(move |signal| {
            let trigger = match signal {
                LifecycleSignal::Online => SyncTrigger::Online,
                LifecycleSignal::Focus => SyncTrigger::Focus,
                LifecycleSignal::Offline => return,
            };
            // The loop only stops on shutdown.
            let _ = triggers.send(trigger);
        });
        inner.subscriptions.lock().push(subscription);

        let worker = tokio::spawn(run_triggers(
            Arc::downgrade(inner),
            receiver,
            inner.shutdown.clone(),
            inner.config.sync_interval,
        ));
        *inner.worker.lock() = Some(worker);

        info!(
            interval = ?inner.config.sync_interval,
            online = inner.network.is_online(),
            "sync engine initialized"
        );
        Ok(())
    }

    /// Stops the background loop and aborts any in-flight request.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                warn!(error = %err, "trigger loop ended abnormally");
            }
        }
        info!("sync engine stopped");
    }

    /// Records a local write. Never touches the network.
    ///
    /// See [`MutationQueue::enqueue`].
    pub fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> SyncResult<Option<PendingChange>> {
        self.inner
            .queue
            .enqueue(entity_type, entity_id, operation, payload)
    }

    /// Returns a snapshot of the sync status.
    pub fn get_status(&self) -> SyncStatus {
        self.inner.status.snapshot()
    }

    /// Registers a listener called with every status change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.status.subscribe(listener)
    }

    /// Returns a receiver holding the latest status.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.watch()
    }

    /// Runs a sync now, or joins the one in flight.
    ///
    /// Returns the summary of the whole flight, including a coalesced
    /// re-run. Offline, it returns an empty summary without touching the
    /// network.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInitialized`] before [`SyncEngine::init`], or
    /// the error that ended the cycle. Queued changes are never lost.
    pub async fn sync_all(&self) -> SyncResult<SyncSummary> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(SyncError::NotInitialized);
        }
        self.inner.sync(SyncTrigger::Manual).await
    }

    /// Requests a sync from the background loop without waiting for it.
    pub fn trigger(&self, trigger: SyncTrigger) {
        if self.inner.triggers.send(trigger).is_err() {
            debug!(?trigger, "trigger loop stopped, dropping trigger");
        }
    }

    /// Aborts the in-flight push or pull, if any. The cycle ends as
    /// cancelled and the background loop keeps running.
    pub fn cancel(&self) {
        self.inner.cycle_cancel.lock().cancel();
    }

    /// Lists unresolved conflicts, oldest first.
    pub fn list_conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        self.inner.conflicts.list()
    }

    /// Resolves a conflict. The resolved change is pushed by the next sync.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConflictNotFound`] for an unknown or already
    /// resolved conflict, or a storage error, in which case nothing changed.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> SyncResult<SyncConflict> {
        self.inner.applier.resolve(conflict_id, resolution)
    }

    /// Registers the merge used by [`Resolution::Merge`] for an entity type.
    pub fn register_merge(
        &self,
        entity_type: impl Into<String>,
        merge: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) {
        self.inner.applier.merges().register(entity_type, merge);
    }

    /// Clears failure flags and backoff so every queued change is pushed
    /// again. Returns how many flagged changes were cleared.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        self.inner.queue.retry_failed()
    }

    /// Returns the current orchestrator state.
    pub fn state(&self) -> SyncState {
        *self.inner.state.read()
    }

    /// Returns the network monitor fed by platform signals.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.inner.network
    }

    /// Returns the mutation queue.
    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.inner.queue
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("status", &self.get_status())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Flight {
    running: bool,
    rerun: bool,
    generation: u64,
}

#[derive(Debug, Clone, Default)]
struct FlightReport {
    generation: u64,
    outcome: Option<SyncResult<SyncSummary>>,
}

struct EngineInner {
    config: SyncConfig,
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: ConflictStore,
    applier: ResolutionApplier,
    network: Arc<NetworkMonitor>,
    client: RemoteSyncClient,
    status: Arc<StatusAggregator>,
    clock: Arc<dyn Clock>,
    state: RwLock<SyncState>,
    flight: Mutex<Flight>,
    finished: watch::Sender<FlightReport>,
    shutdown: CancellationToken,
    cycle_cancel: Mutex<CancellationToken>,
    consecutive_failures: AtomicU32,
    retry_epoch: Arc<AtomicU64>,
    triggers: mpsc::UnboundedSender<SyncTrigger>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    initialized: AtomicBool,
}

/// Ends the flight even if the future running it is dropped.
struct FlightGuard<'a> {
    inner: &'a EngineInner,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, outcome: &SyncResult<SyncSummary>) {
        self.finished = true;
        self.inner.finish_flight(outcome.clone());
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.set_state(SyncState::Idle);
            self.inner.finish_flight(Err(SyncError::Cancelled));
        }
    }
}

impl EngineInner {
    async fn sync(&self, trigger: SyncTrigger) -> SyncResult<SyncSummary> {
        let mut finished = self.finished.subscribe();
        let joined = {
            let mut flight = self.flight.lock();
            if flight.running {
                flight.rerun = true;
                Some(flight.generation)
            } else {
                flight.running = true;
                flight.rerun = false;
                self.status.set_syncing(true);
                None
            }
        };

        if let Some(generation) = joined {
            debug!(?trigger, "sync in flight, coalescing");
            let report = finished
                .wait_for(|report| report.generation > generation)
                .await
                .map_err(|_| SyncError::Cancelled)?;
            return report.outcome.clone().unwrap_or(Err(SyncError::Cancelled));
        }

        let guard = FlightGuard {
            inner: self,
            finished: false,
        };
        let mut total = SyncSummary::default();
        let outcome = loop {
            let span = info_span!("sync_cycle", ?trigger);
            match self.cycle().instrument(span).await {
                Ok((summary, revision)) => {
                    total += summary;
                    let rerun = std::mem::take(&mut self.flight.lock().rerun);
                    if rerun && self.queue.revision() != revision {
                        debug!("local writes arrived during the cycle, running again");
                        continue;
                    }
                    break Ok(total);
                }
                Err(err) => break Err(err),
            }
        };
        guard.finish(&outcome);
        outcome
    }

    fn finish_flight(&self, outcome: SyncResult<SyncSummary>) {
        let mut flight = self.flight.lock();
        flight.running = false;
        flight.rerun = false;
        flight.generation += 1;
        self.finished.send_replace(FlightReport {
            generation: flight.generation,
            outcome: Some(outcome),
        });
        self.status.set_syncing(false);
    }

    /// Runs one cycle. Returns its summary and the queue revision its push
    /// snapshot saw.
    async fn cycle(&self) -> SyncResult<(SyncSummary, u64)> {
        let cancel = self.shutdown.child_token();
        *self.cycle_cancel.lock() = cancel.clone();

        self.set_state(SyncState::Checking);
        if !self.network.is_online() {
            debug!("offline, skipping cycle");
            self.set_state(SyncState::Idle);
            return Ok((SyncSummary::default(), self.queue.revision()));
        }

        let result = self.run_phases(&cancel).await;
        self.settle(&result);
        result
    }

    async fn run_phases(&self, cancel: &CancellationToken) -> SyncResult<(SyncSummary, u64)> {
        let mut summary = SyncSummary::default();
        let mut echoes = Echoes::new();

        self.set_state(SyncState::Pushing);
        let revision = self.queue.revision();
        self.push_phase(cancel, &mut summary, &mut echoes).await?;
        self.pull_phase(cancel, &mut summary, &echoes).await?;

        if summary.transferred() {
            let now = self.clock.now();
            self.store
                .transaction(|txn| txn.set_meta(LAST_SYNC_KEY, &now))?;
            self.status.set_last_sync_time(now);
        }
        Ok((summary, revision))
    }

    async fn push_phase(
        &self,
        cancel: &CancellationToken,
        summary: &mut SyncSummary,
        echoes: &mut Echoes,
    ) -> SyncResult<()> {
        let held: HashSet<String> = self
            .store
            .conflicts()?
            .into_iter()
            .map(|conflict| conflict.entity_id)
            .collect();
        let ready: Vec<PendingChange> = self
            .queue
            .ready(self.clock.now())?
            .into_iter()
            .filter(|change| !held.contains(&change.entity_id))
            .collect();
        if ready.is_empty() {
            debug!(held = held.len(), "nothing to push");
            return Ok(());
        }

        let (valid, invalid): (Vec<_>, Vec<_>) =
            ready.into_iter().partition(|change| change.validate().is_ok());
        if !invalid.is_empty() {
            summary.failed += self.store.transaction(|txn| {
                let mut flagged = 0;
                for change in &invalid {
                    let reason = change
                        .validate()
                        .err()
                        .map_or_else(String::new, |err| err.to_string());
                    if flag_in(txn, &change.entity_id, Some(change.idempotency_key), &reason)? {
                        flagged += 1;
                    }
                }
                Ok(flagged)
            })?;
        }

        let claimed = self.queue.claim(&valid)?;
        let batch_size = usize::try_from(self.config.push_batch_size).unwrap_or(usize::MAX);
        for batch in claimed.chunks(batch_size.max(1)) {
            let response = match self.client.push(batch, cancel).await {
                Ok(response) => response,
                Err(err) => {
                    if err.kind() == ErrorKind::Network {
                        summary.failed += self.queue.record_failure(batch, &err.to_string())?;
                    }
                    return Err(err);
                }
            };
            *summary += self.apply_push_response(batch, &response, echoes)?;
        }
        Ok(())
    }

    fn apply_push_response(
        &self,
        batch: &[PendingChange],
        response: &PushResponse,
        echoes: &mut Echoes,
    ) -> SyncResult<SyncSummary> {
        let sent: HashMap<&str, &PendingChange> = batch
            .iter()
            .map(|change| (change.entity_id.as_str(), change))
            .collect();
        let now = self.clock.now();

        let counts = self.store.transaction(|txn| {
            let mut counts = SyncSummary::default();

            for entity_id in &response.acked {
                let Some(change) = sent.get(entity_id.as_str()) else {
                    continue;
                };
                counts.synced += 1;
                let version = response.acked_version(entity_id);
                match txn.pending(entity_id)? {
                    Some(current) if current.idempotency_key == change.idempotency_key => {
                        txn.delete_pending(entity_id)?;
                    }
                    Some(current) => {
                        debug!(entity_id = %entity_id, "change rewritten in flight, keeping it queued");
                        if let Some(version) = version {
                            rebase(txn, &current, version)?;
                        }
                    }
                    None => {}
                }
                if let Some(version) = version {
                    learn_version(txn, entity_id, version)?;
                }
            }

            for rejected in &response.rejected {
                let Some(change) = sent.get(rejected.entity_id.as_str()) else {
                    continue;
                };
                if flag_in(
                    txn,
                    &rejected.entity_id,
                    Some(change.idempotency_key),
                    &rejected.reason,
                )? {
                    counts.failed += 1;
                }
            }

            for reported in &response.conflicts {
                let Some(current) = txn.pending(&reported.entity_id)? else {
                    continue;
                };
                match ConflictDetector::classify_push_conflict(&current, reported) {
                    Reconcile::Converge => {
                        txn.delete_pending(&reported.entity_id)?;
                        txn.delete_conflict(&reported.entity_id)?;
                        write_server_state(
                            txn,
                            &current.entity_type,
                            &reported.entity_id,
                            &reported.server_data,
                            reported.server_version,
                            reported.server_timestamp,
                        )?;
                    }
                    Reconcile::Conflict { local, server } => {
                        upsert_in(txn, &current.entity_type, &reported.entity_id, local, server, now)?;
                        counts.conflicts += 1;
                    }
                    Reconcile::Apply | Reconcile::Skip => {}
                }
            }
            Ok(counts)
        })?;

        for entity_id in &response.acked {
            if let Some(change) = sent.get(entity_id.as_str()) {
                echoes.insert(entity_id.clone(), change.payload.clone());
            }
        }
        Ok(counts)
    }

    async fn pull_phase(
        &self,
        cancel: &CancellationToken,
        summary: &mut SyncSummary,
        echoes: &Echoes,
    ) -> SyncResult<()> {
        let mut cursor: Cursor = self.store.meta(CURSOR_KEY)?.unwrap_or_default();
        loop {
            self.set_state(SyncState::Pulling);
            let page = self
                .client
                .pull(&cursor, self.config.pull_batch_size, cancel)
                .await?;

            self.set_state(SyncState::Reconciling);
            *summary += self.reconcile(&page, echoes)?;

            let advanced = page.new_cursor != cursor;
            cursor = page.new_cursor;
            if !page.has_more {
                return Ok(());
            }
            if !advanced {
                warn!(cursor = %cursor, "server reported more changes without advancing the cursor");
                return Ok(());
            }
        }
    }

    /// Applies one pulled page and advances the cursor in one batch.
    fn reconcile(&self, page: &PullPage, echoes: &Echoes) -> SyncResult<SyncSummary> {
        let now = self.clock.now();
        self.store.transaction(|txn| {
            let mut counts = SyncSummary::default();

            for delta in &page.deltas {
                let entity_id = delta.entity_id.as_str();
                let entity = txn.entity(entity_id)?;
                let pending = txn.pending(entity_id)?;

                if let Some(change) = &pending {
                    if is_own_echo(change, delta, echoes) {
                        rebase(txn, change, delta.server_version)?;
                        learn_version(txn, entity_id, delta.server_version)?;
                        continue;
                    }
                }

                match ConflictDetector::classify_delta(entity.as_ref(), pending.as_ref(), delta) {
                    Reconcile::Apply => {
                        write_delta(txn, delta)?;
                        counts.pulled += 1;
                    }
                    Reconcile::Converge => {
                        txn.delete_pending(entity_id)?;
                        txn.delete_conflict(entity_id)?;
                        write_delta(txn, delta)?;
                        counts.pulled += 1;
                    }
                    Reconcile::Skip => {
                        debug!(entity_id, version = delta.server_version, "server change already reflected locally");
                    }
                    Reconcile::Conflict { local, server } => {
                        upsert_in(txn, &delta.entity_type, entity_id, local, server, now)?;
                        counts.conflicts += 1;
                    }
                }
            }

            txn.set_meta(CURSOR_KEY, &page.new_cursor)?;
            Ok(counts)
        })
    }

    fn settle(&self, result: &SyncResult<(SyncSummary, u64)>) {
        match result {
            Ok((summary, _)) => {
                self.set_state(SyncState::Idle);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.retry_epoch.fetch_add(1, Ordering::SeqCst);
                self.status.set_last_error(None);
                info!(
                    synced = summary.synced,
                    failed = summary.failed,
                    pulled = summary.pulled,
                    conflicts = summary.conflicts,
                    "sync cycle complete"
                );
                self.schedule_backoff_wakeup();
            }
            Err(SyncError::Cancelled) => {
                self.set_state(SyncState::Idle);
                info!("sync cycle cancelled");
            }
            Err(err) => {
                self.set_state(SyncState::Error);
                self.status.set_last_error(Some(err.to_string()));
                match err.kind() {
                    ErrorKind::Auth | ErrorKind::Storage => {
                        error!(error = %err, kind = ?err.kind(), "sync cycle failed");
                    }
                    _ => warn!(error = %err, kind = ?err.kind(), "sync cycle failed"),
                }
                if err.is_retryable() {
                    self.schedule_retry();
                }
            }
        }
    }

    fn schedule_retry(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let retry = &self.config.retry;
        if retry.is_exhausted(failures) {
            warn!(failures, "retry budget exhausted, waiting for the next trigger");
            return;
        }

        // Firing before the queued changes leave their backoff would push
        // nothing and reset the failure count.
        let mut delay = retry.delay_for_attempt(failures);
        if let Some(backoff) = self.backoff_remaining() {
            delay = delay.max(backoff);
        }
        debug!(?delay, failures, "scheduling retry");
        self.arm_retry(delay);
    }

    /// Wakes the loop when the earliest backed-off change becomes ready.
    fn schedule_backoff_wakeup(&self) {
        if let Some(delay) = self.backoff_remaining() {
            debug!(?delay, "waiting for backed-off changes");
            self.arm_retry(delay);
        }
    }

    fn backoff_remaining(&self) -> Option<Duration> {
        match self.queue.next_attempt_in() {
            Ok(delay) => delay,
            Err(err) => {
                warn!(error = %err, "could not read queue backoff");
                None
            }
        }
    }

    /// Sends a retry trigger after `delay` unless a newer retry or a
    /// successful cycle supersedes it.
    fn arm_retry(&self, delay: Duration) {
        if !self.initialized.load(Ordering::SeqCst) {
            return;
        }
        let epoch = self.retry_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.retry_epoch);
        let triggers = self.triggers.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if current.load(Ordering::SeqCst) == epoch {
                        let _ = triggers.send(SyncTrigger::Retry);
                    }
                }
            }
        });
    }

    fn set_state(&self, state: SyncState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "sync state changed");
        }
    }
}

async fn run_triggers(
    inner: Weak<EngineInner>,
    mut receiver: mpsc::UnboundedReceiver<SyncTrigger>,
    shutdown: CancellationToken,
    interval: Duration,
) {
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => SyncTrigger::Interval,
            received = receiver.recv() => match received {
                Some(trigger) => trigger,
                None => break,
            },
        };
        let Some(engine) = inner.upgrade() else {
            break;
        };
        debug!(?trigger, "sync requested");
        tokio::spawn(async move {
            // Outcomes are recorded in the status.
            let _ = engine.sync(trigger).await;
        });
    }
    debug!("trigger loop stopped");
}

fn is_own_echo(change: &PendingChange, delta: &EntityDelta, echoes: &Echoes) -> bool {
    let newer = change
        .base_version
        .map_or(true, |base| base < delta.server_version);
    newer
        && echoes
            .get(&delta.entity_id)
            .is_some_and(|pushed| *pushed == delta.effective_payload())
}

/// Moves a pending change written after an acknowledged push onto the
/// version that push produced.
fn rebase(txn: &mut StoreTxn<'_>, change: &PendingChange, version: Version) -> SyncResult<()> {
    if change.base_version.is_some_and(|base| base >= version) {
        return Ok(());
    }
    debug!(
        entity_id = %change.entity_id,
        version,
        "rebasing change onto its own acknowledged write"
    );
    let operation = match change.operation {
        Operation::Create => Operation::Update,
        other => other,
    };
    txn.put_pending(&PendingChange {
        operation,
        base_version: Some(version),
        ..change.clone()
    })
}

/// Records the server version of a local entity, never moving it backwards.
fn learn_version(txn: &mut StoreTxn<'_>, entity_id: &str, version: Version) -> SyncResult<()> {
    let Some(entity) = txn.entity(entity_id)? else {
        return Ok(());
    };
    if entity.server_version.is_some_and(|known| known >= version) {
        return Ok(());
    }
    txn.put_entity(&Entity {
        server_version: Some(version),
        ..entity
    })
}

fn write_delta(txn: &mut StoreTxn<'_>, delta: &EntityDelta) -> SyncResult<()> {
    write_server_state(
        txn,
        &delta.entity_type,
        &delta.entity_id,
        &delta.effective_payload(),
        Some(delta.server_version),
        delta.server_timestamp,
    )
}

/// Writes server data as the local entity; `null` deletes it.
fn write_server_state(
    txn: &mut StoreTxn<'_>,
    entity_type: &str,
    entity_id: &str,
    data: &Value,
    version: Option<Version>,
    at: Timestamp,
) -> SyncResult<()> {
    if data.is_null() {
        txn.delete_entity(entity_id);
        return Ok(());
    }
    let existing = txn.entity(entity_id)?;
    let (local_version, known) = existing.map_or((0, None), |e| (e.local_version, e.server_version));
    txn.put_entity(&Entity {
        id: entity_id.to_string(),
        entity_type: entity_type.to_string(),
        payload: data.clone(),
        local_version,
        server_version: version.or(known),
        updated_at: at,
    })
}
