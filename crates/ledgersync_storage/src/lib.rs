//! # ledgersync storage
//!
//! Durable key/value backends for the ledgersync offline-first sync engine.
//!
//! Backends are **opaque byte stores** grouped into a handful of fixed
//! tables. They never interpret the values they hold; the engine owns all
//! serialization of entities, pending changes and conflicts.
//!
//! ## Design Principles
//!
//! - Every write goes through [`KvBackend::commit`] with a [`WriteBatch`]
//! - A batch is applied completely or not at all
//! - Reads always observe the last committed batch
//! - Must be `Send + Sync` so the engine can share one backend
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral stores
//! - [`FileBackend`] - Append-only commit log that survives restart
//!
//! ## Example
//!
//! ```rust
//! use ledgersync_storage::{InMemoryBackend, KvBackend, Table, WriteBatch};
//!
//! let backend = InMemoryBackend::new();
//! let mut batch = WriteBatch::new();
//! batch.put(Table::Meta, "cursor", b"42".to_vec());
//! backend.commit(batch).unwrap();
//! assert_eq!(backend.get(Table::Meta, "cursor").unwrap(), Some(b"42".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{KvBackend, Table, WriteBatch, WriteOp};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
