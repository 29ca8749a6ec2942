//! # offsync engine
//!
//! Offline-first change queue and sync controller.
//!
//! This crate provides:
//! - [`ChangeLedger`]: the durable queue of client mutations
//! - [`ConnectivityMonitor`]: the online/offline signal
//! - [`SyncController`]: drains the ledger in per-endpoint batches, applies
//!   server answers and routes conflicts through the [`ConflictPolicy`]
//! - [`scheduler`]: the background loop driving the controller
//! - [`SyncTransport`] with HTTP and mock implementations
//!
//! ## Flow
//!
//! 1. The caller queues a mutation with [`SyncController::queue_change`]. It
//!    is durable before the call returns and the local record is updated
//!    optimistically, online or not.
//! 2. An episode groups eligible changes by endpoint and sends one batch per
//!    endpoint, concurrently.
//! 3. Accepted changes leave the ledger and their records become `synced`.
//!    Conflicts are resolved by policy. Failed batches back off
//!    exponentially until `max_retries`, after which the change is kept as
//!    `exhausted` and reported once.
//!
//! ## Key Invariants
//!
//! - A change stays in the ledger until the server accepts it or it is
//!   discarded by hand
//! - A record is `pending` while any unconfirmed change references it
//! - At most one episode runs at a time
//! - Applying the same server answer twice is a no-op

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connectivity;
mod controller;
mod error;
mod http;
mod ledger;
mod observer;
pub mod scheduler;
mod transport;

pub use clock::TokioClock;
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::ConnectivityMonitor;
pub use controller::{
    SyncController, SyncCycleResult, SyncState, SyncStats, SyncStatusReport, SYNC_CONFLICTS,
};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use ledger::{ChangeLedger, PENDING_CHANGES};
pub use observer::{SyncErrorReport, SyncObserver};
pub use scheduler::SyncHandle;
pub use transport::{MockReply, MockTransport, SyncTransport};

pub use offsync_protocol::{
    Action, ChangeId, ChangeRequest, ChangeState, Conflict, ConflictId, ConflictPolicy,
    LocalRecord, Method, QueuedChange, SyncBatchRequest, SyncBatchResponse, SyncStatus,
};
pub use offsync_storage::{LocalStore, Query, RecordKey, SortDirection};
