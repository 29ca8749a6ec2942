//! # offsync server
//!
//! Reference sync server for offsync.
//!
//! This crate provides:
//! - Batch handling for `/{endpoint}/sync`
//! - Version checks that turn stale writes into conflicts
//! - Deduplication of resent changes
//! - Failure injection for tests
//!
//! # Architecture
//!
//! The server keeps its records in the same [`offsync_storage::LocalStore`]
//! clients use (no external database). Every record carries a `version` that
//! is bumped on each write. A client change whose base version differs from
//! the record's version is reported back as a conflict together with the
//! server's copy.
//!
//! The server has no network listener: [`SyncServer::handle_post`] takes a
//! path and a JSON body, so it can sit behind any HTTP stack or be called in
//! process.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod error;
mod handler;
mod records;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use records::{RecordTable, APPLIED_CHANGES};
pub use server::SyncServer;
