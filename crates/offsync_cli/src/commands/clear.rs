//! Clear command implementation.

use super::{has_collection, is_reserved, open_store, CliError};
use offsync_storage::LocalStore;
use std::path::Path;

/// Runs the clear command.
pub fn run(path: &Path, collection: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let removed = clear(&store, collection)?;
    println!("✓ Removed {removed} record(s) from {collection}");
    Ok(())
}

/// Removes every cached record of a collection. Queued changes are kept.
///
/// Returns the number of records removed.
pub fn clear(store: &LocalStore, collection: &str) -> Result<usize, CliError> {
    if is_reserved(collection) {
        return Err(CliError::ReservedCollection(collection.to_string()));
    }
    if !has_collection(store, collection) {
        return Err(CliError::UnknownCollection(collection.to_string()));
    }
    let removed = store.count(collection)?;
    store.clear(collection)?;
    tracing::info!(%collection, removed, "collection cleared");
    Ok(removed)
}
