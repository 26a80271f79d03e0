//! # ledgersync sync server
//!
//! In-process reference server for the ledgersync push/pull protocol.
//!
//! This crate provides:
//! - Push handling with per-change acknowledgement, conflicts and rejections
//! - Cursor-paged pulls over a server-side change log
//! - Idempotent replays keyed by each change's idempotency key
//! - Optional bearer-token authentication (HMAC-SHA256)
//!
//! # Conflict Detection
//!
//! Every server write bumps the entity's version. A pushed change carries
//! the version it was based on; if the server moved past it and holds
//! different data, the change is returned as a conflict and not applied.
//!
//! # Authentication
//!
//! ```rust
//! use ledgersync_sync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::new(config);
//! let token = server.issue_token("device-1").unwrap();
//! # let _ = token;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod handler;
mod oplog;
mod server;

pub use auth::{AuthConfig, SimpleTokenValidator, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use oplog::{ApplyOutcome, LogEntry, OplogSnapshot, ServerEntity, ServerOplog};
pub use server::SyncServer;
