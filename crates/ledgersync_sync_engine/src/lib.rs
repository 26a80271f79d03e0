//! # ledgersync sync engine
//!
//! Offline-first synchronization for a personal-finance data set.
//!
//! This crate provides:
//! - A typed, transactional local store over any [`ledgersync_storage::KvBackend`]
//! - A persistent, coalescing mutation queue with per-change backoff
//! - Connectivity tracking and sync triggers
//! - A timeout- and cancellation-aware remote client, with an HTTP transport
//! - Conflict detection, storage and transactional resolution
//! - A single-flight sync orchestrator and an observable status
//!
//! ## Architecture
//!
//! Domain writes call [`SyncEngine::enqueue`], which writes the entity and
//! its pending change in one atomic batch and never waits on the network.
//! A sync cycle pushes the queue first, then pulls server changes:
//!
//! 1. Push ready changes in batches; acknowledged changes leave the queue
//! 2. Pull pages of server changes after the stored cursor
//! 3. Apply clean changes, store divergent ones as conflicts
//! 4. Advance the cursor in the same batch as the applied page
//!
//! ## Key Invariants
//!
//! - At most one pending change and one conflict per entity
//! - Only one sync cycle runs at a time
//! - Conflicts are never resolved automatically
//! - A failed write leaves the queue and conflicts exactly as they were

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod clock;
mod config;
mod conflicts;
mod detector;
mod engine;
mod error;
mod http;
mod listeners;
mod network;
mod queue;
mod resolution;
mod state;
mod status;
mod store;
mod transport;

pub use client::{PullPage, RemoteSyncClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use conflicts::ConflictStore;
pub use detector::{ConflictDetector, Reconcile};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use http::HttpTransport;
pub use listeners::{Listeners, Subscription};
pub use network::{LifecycleSignal, NetworkMonitor};
pub use queue::MutationQueue;
pub use resolution::{MergeFn, MergeRegistry, ResolutionApplier};
pub use state::{SyncState, SyncSummary, SyncTrigger};
pub use status::{StatusAggregator, SyncPhase, SyncStatus};
pub use store::{LocalStore, StoreDelta, StoreTxn};
pub use transport::{MockTransport, SyncTransport};
