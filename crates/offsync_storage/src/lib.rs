//! # offsync storage
//!
//! Durable local store for offsync.
//!
//! This crate provides:
//! - [`StorageBackend`]: an opaque append-only byte store, with in-memory and
//!   file implementations
//! - A checksummed journal layered on top of a backend
//! - [`LocalStore`]: named collections of JSON records with a primary key,
//!   per-collection secondary indexes, queries, and atomic write batches
//!
//! ## Design Principles
//!
//! - Every mutating call is one journal entry, so it is either fully durable
//!   or absent after a crash
//! - The schema is provisioned idempotently; calling [`LocalStore::provision`]
//!   on every startup is safe
//! - Storage errors (quota, I/O, corruption) are returned to the caller, never
//!   masked
//!
//! ## Example
//!
//! ```rust
//! use offsync_storage::{CollectionSchema, LocalStore, Query, StoreSchema};
//! use serde_json::json;
//!
//! let store = LocalStore::in_memory();
//! store
//!     .provision(&StoreSchema::new().collection(
//!         CollectionSchema::new("tasks").index("syncStatus", "syncStatus"),
//!     ))
//!     .unwrap();
//!
//! store
//!     .put("tasks", json!({"id": 1, "title": "write docs", "syncStatus": "pending"}))
//!     .unwrap();
//!
//! let pending = store
//!     .get_all("tasks", &Query::new().by_index("syncStatus", json!("pending")))
//!     .unwrap();
//! assert_eq!(pending.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod clock;
mod dir;
mod error;
mod file;
mod journal;
mod key;
mod memory;
mod query;
mod schema;
mod store;

pub use backend::StorageBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dir::StoreDir;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{compute_crc32, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use key::{IndexValue, RecordKey};
pub use memory::InMemoryBackend;
pub use query::{Query, SortDirection};
pub use schema::{CollectionSchema, IndexSchema, StoreSchema};
pub use store::{
    Document, LocalStore, StorageEstimate, StoreConfig, WriteBatch, KEY_FIELD, UPDATED_AT_FIELD,
};
