//! # ledgersync sync protocol
//!
//! Data model and wire messages for the ledgersync sync engine.
//!
//! This crate provides:
//! - [`Entity`], the versioned record tracked by the engine
//! - [`PendingChange`] and the per-entity coalescing rules
//! - [`SyncConflict`] and [`Resolution`]
//! - Protocol messages (push, pull) with JSON encoding
//!
//! This is a pure protocol crate with no I/O operations. Entity payloads
//! are opaque JSON; the only interpretation is top-level key diffing for
//! display and shallow field merging when local writes coalesce.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod entity;
mod error;
mod messages;
mod operation;
mod payload;

pub use change::{coalesce, Coalesced, PendingChange};
pub use conflict::{ConflictStatus, LocalChange, Resolution, ServerChange, SyncConflict};
pub use entity::{Entity, Timestamp, Version};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Cursor, EntityDelta, MalformedChange, PullRequest, PullResponse, PushChange, PushConflict,
    PushRequest, PushResponse, RejectedChange,
};
pub use operation::Operation;
pub use payload::{changed_fields, merge_fields};
