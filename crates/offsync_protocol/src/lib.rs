//! # offsync protocol
//!
//! Data model and wire types for offsync.
//!
//! This crate provides:
//! - [`QueuedChange`]: a durable record of one client mutation
//! - [`LocalRecord`] and [`SyncStatus`] for cached server records
//! - [`SyncBatchRequest`] / [`SyncBatchResponse`], the batched wire contract
//! - [`Conflict`], [`ConflictPolicy`] and the pure [`resolve`] function
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod id;
mod messages;
mod record;

pub use change::{ChangeRequest, ChangeState, Method, QueuedChange, RECORD_ID_FIELD, VERSION_FIELD};
pub use conflict::{resolve, Action, Conflict, ConflictPolicy};
pub use error::{ProtocolError, ProtocolResult};
pub use id::{ChangeId, ConflictId};
pub use messages::{ConflictReport, SyncBatchRequest, SyncBatchResponse};
pub use record::{LocalRecord, SyncStatus, SYNC_STATUS_FIELD};
