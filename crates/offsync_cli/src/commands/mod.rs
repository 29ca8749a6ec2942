//! CLI command implementations.

pub mod clear;
pub mod compact;
pub mod discard;
pub mod inspect;
pub mod pending;
pub mod retry;

use offsync_engine::{ChangeLedger, PENDING_CHANGES, SYNC_CONFLICTS};
use offsync_protocol::{ChangeId, ProtocolError};
use offsync_storage::{LocalStore, StorageError, StoreConfig};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// The change id could not be parsed.
    #[error("invalid change id: {0}")]
    InvalidId(#[from] ProtocolError),

    /// No queued change has this id.
    #[error("no queued change {0}")]
    UnknownChange(ChangeId),

    /// The store has no such collection.
    #[error("no collection named {0}")]
    UnknownCollection(String),

    /// The collection belongs to the sync engine.
    #[error("{0} is managed by the sync engine; use retry or discard instead")]
    ReservedCollection(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Opens an existing store directory. Never creates one.
pub fn open_store(path: &Path) -> Result<Arc<LocalStore>, StorageError> {
    let config = StoreConfig::default().create_if_missing(false);
    Ok(Arc::new(LocalStore::open_dir(path, config)?))
}

/// Opens the change ledger, if the store has one.
pub fn open_ledger(
    store: &Arc<LocalStore>,
) -> Result<Option<ChangeLedger>, Box<dyn std::error::Error>> {
    if !has_collection(store, PENDING_CHANGES) {
        return Ok(None);
    }
    Ok(Some(ChangeLedger::open(Arc::clone(store))?))
}

/// Returns true if the store holds `name`.
pub fn has_collection(store: &LocalStore, name: &str) -> bool {
    store.collections().iter().any(|c| c == name)
}

/// Returns true for collections owned by the sync engine.
pub fn is_reserved(name: &str) -> bool {
    name == PENDING_CHANGES || name == SYNC_CONFLICTS
}

/// Parses a change id argument.
pub fn parse_change_id(value: &str) -> Result<ChangeId, CliError> {
    Ok(value.trim().parse()?)
}
