//! Observable sync status for UI collaborators.

use crate::error::SyncResult;
use crate::listeners::{Listeners, Subscription};
use crate::store::{LocalStore, StoreDelta, LAST_SYNC_KEY};
use ledgersync_sync_protocol::Timestamp;
use parking_lot::{ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Snapshot of the engine's observable state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current connectivity.
    pub is_online: bool,
    /// True while a sync flight (a cycle plus any coalesced re-run) runs.
    pub is_syncing: bool,
    /// Number of pending changes.
    pub pending_count: usize,
    /// Pending changes per entity type.
    pub pending_by_type: BTreeMap<String, usize>,
    /// Pending changes flagged as failed.
    pub failed_count: usize,
    /// Number of unresolved conflicts.
    pub conflict_count: usize,
    /// Message of the error that ended the last cycle, if it failed.
    pub last_error: Option<String>,
    /// Time of the last cycle that transferred changes.
    pub last_sync_time: Option<Timestamp>,
}

/// The single state a UI shows, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No connectivity.
    Offline,
    /// A sync is running.
    Syncing,
    /// Conflicts await resolution.
    Conflict,
    /// The last cycle failed.
    Error,
    /// Local changes wait to be pushed.
    Pending,
    /// Everything is synchronized.
    Synced,
}

impl SyncStatus {
    /// Derives the display phase.
    pub fn phase(&self) -> SyncPhase {
        if !self.is_online {
            SyncPhase::Offline
        } else if self.is_syncing {
            SyncPhase::Syncing
        } else if self.conflict_count > 0 {
            SyncPhase::Conflict
        } else if self.last_error.is_some() {
            SyncPhase::Error
        } else if self.pending_count > 0 {
            SyncPhase::Pending
        } else {
            SyncPhase::Synced
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncPhase::Offline => "offline",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Conflict => "conflict",
            SyncPhase::Error => "error",
            SyncPhase::Pending => "pending",
            SyncPhase::Synced => "synced",
        })
    }
}

/// Maintains [`SyncStatus`] from store deltas, connectivity and cycle
/// progress.
///
/// Counts are rebuilt from the store once by [`StatusAggregator::rehydrate`]
/// and then updated incrementally. Subscribers are notified only when the
/// snapshot actually changes, in the order the updates were applied, so the
/// last snapshot delivered always equals [`StatusAggregator::snapshot`].
pub struct StatusAggregator {
    status: RwLock<SyncStatus>,
    listeners: Listeners<SyncStatus>,
    watch: watch::Sender<SyncStatus>,
    /// Held from mutation until listeners are notified. Reentrant so a
    /// listener may itself update the status.
    publish: ReentrantMutex<()>,
}

impl StatusAggregator {
    /// Creates an aggregator with empty counts.
    pub fn new(is_online: bool) -> Self {
        let status = SyncStatus {
            is_online,
            ..SyncStatus::default()
        };
        let (watch, _) = watch::channel(status.clone());
        Self {
            status: RwLock::new(status),
            listeners: Listeners::new(),
            watch,
            publish: ReentrantMutex::new(()),
        }
    }

    /// Rebuilds every count from the store.
    pub fn rehydrate(&self, store: &LocalStore) -> SyncResult<()> {
        let pending = store.pending_changes()?;
        let conflicts = store.conflicts()?;
        let last_sync_time: Option<Timestamp> = store.meta(LAST_SYNC_KEY)?;

        self.update(|status| {
            status.pending_by_type.clear();
            for change in &pending {
                *status
                    .pending_by_type
                    .entry(change.entity_type.clone())
                    .or_insert(0) += 1;
            }
            status.pending_count = pending.len();
            status.failed_count = pending.iter().filter(|c| c.is_failed()).count();
            status.conflict_count = conflicts.len();
            status.last_sync_time = last_sync_time;
        });
        Ok(())
    }

    /// Applies the count changes of one committed transaction.
    pub fn apply_delta(&self, delta: &StoreDelta) {
        self.update(|status| {
            for (entity_type, change) in &delta.pending_by_type {
                let count = status
                    .pending_by_type
                    .entry(entity_type.clone())
                    .or_insert(0);
                *count = offset(*count, *change);
            }
            status.pending_by_type.retain(|_, count| *count > 0);
            status.pending_count = status.pending_by_type.values().sum();
            status.failed_count = offset(status.failed_count, delta.failed);
            status.conflict_count = offset(status.conflict_count, delta.conflicts);
        });
    }

    /// Records connectivity.
    pub fn set_online(&self, is_online: bool) {
        self.update(|status| status.is_online = is_online);
    }

    /// Records whether a sync flight is running.
    pub fn set_syncing(&self, is_syncing: bool) {
        self.update(|status| status.is_syncing = is_syncing);
    }

    /// Records the outcome of a cycle's error handling.
    pub fn set_last_error(&self, last_error: Option<String>) {
        self.update(|status| status.last_error = last_error);
    }

    /// Records a successful transfer.
    pub fn set_last_sync_time(&self, at: Timestamp) {
        self.update(|status| status.last_sync_time = Some(at));
    }

    /// Returns an immutable copy of the current status.
    pub fn snapshot(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Registers a listener called with each new snapshot.
    pub fn subscribe(&self, listener: impl Fn(&SyncStatus) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Returns a receiver that always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<SyncStatus> {
        self.watch.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let _publishing = self.publish.lock();
        let changed = {
            let mut status = self.status.write();
            let before = status.clone();
            f(&mut status);
            (*status != before).then(|| status.clone())
        };

        if let Some(snapshot) = changed {
            self.watch.send_replace(snapshot.clone());
            self.listeners.notify(&snapshot);
        }
    }
}

impl std::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("status", &*self.status.read())
            .finish()
    }
}

fn offset(count: usize, change: i64) -> usize {
    if change >= 0 {
        count.saturating_add(usize::try_from(change).unwrap_or(usize::MAX))
    } else {
        count.saturating_sub(usize::try_from(change.unsigned_abs()).unwrap_or(usize::MAX))
    }
}
