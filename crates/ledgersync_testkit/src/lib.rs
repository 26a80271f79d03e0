//! # ledgersync testkit
//!
//! Test utilities for the ledgersync crates.
//!
//! This crate provides:
//! - Finance payload fixtures and temporary commit logs
//! - A fault-injecting storage backend
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use ledgersync_testkit::prelude::*;
//!
//! let log = TempLog::new().unwrap();
//! let backend = FaultyBackend::new(log.open().unwrap());
//! backend.fail_next_commits(1);
//! assert_eq!(budget("food", 500_000)["amount"], 500_000);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faulty;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
