//! Inspect command implementation.

use super::{has_collection, is_reserved, open_ledger, open_store};
use offsync_engine::{SyncConfig, SYNC_CONFLICTS};
use offsync_protocol::SyncStatus;
use offsync_storage::{LocalStore, Query};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Quota in bytes.
    pub quota_bytes: u64,
    /// Fraction of the quota in use.
    pub usage_ratio: f64,
    /// Record collections.
    pub collections: Vec<CollectionStats>,
    /// Queued changes per state.
    pub changes: BTreeMap<&'static str, usize>,
    /// Unresolved manual conflicts.
    pub conflicts: usize,
}

/// Statistics for a single record collection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Number of records.
    pub records: usize,
    /// Records per sync status. Records without a status are not counted.
    pub by_status: BTreeMap<&'static str, usize>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let result = inspect(path, &store)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the statistics of an open store.
pub fn inspect(
    path: &Path,
    store: &Arc<LocalStore>,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let estimate = store.estimate()?;

    let mut collections = Vec::new();
    for name in store.collections() {
        if is_reserved(&name) {
            continue;
        }
        let mut by_status = BTreeMap::new();
        for record in store.get_all(&name, &Query::new())? {
            if let Some(status) = SyncStatus::of(&record) {
                *by_status.entry(status.as_str()).or_insert(0) += 1;
            }
        }
        collections.push(CollectionStats {
            records: store.count(&name)?,
            name,
            by_status,
        });
    }

    let changes = match open_ledger(store)? {
        Some(ledger) => ledger.count_by_state()?,
        None => BTreeMap::new(),
    };
    let conflicts = if has_collection(store, SYNC_CONFLICTS) {
        store.count(SYNC_CONFLICTS)?
    } else {
        0
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_bytes: estimate.usage,
        quota_bytes: estimate.quota,
        usage_ratio: estimate.ratio(),
        collections,
        changes,
        conflicts,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Journal: {} bytes", result.journal_bytes);
    println!(
        "  Quota:   {} bytes ({:.1}% used)",
        result.quota_bytes,
        result.usage_ratio * 100.0
    );
    println!();

    println!("Collections:");
    if result.collections.is_empty() {
        println!("  (none)");
    }
    for c in &result.collections {
        let statuses = c
            .by_status
            .iter()
            .map(|(status, n)| format!("{status}: {n}"))
            .collect::<Vec<_>>()
            .join(", ");
        if statuses.is_empty() {
            println!("  {:<20} {} records", c.name, c.records);
        } else {
            println!("  {:<20} {} records ({})", c.name, c.records, statuses);
        }
    }
    println!();

    println!("Sync queue:");
    let total: usize = result.changes.values().sum();
    println!("  Changes:   {total}");
    for (state, n) in &result.changes {
        println!("    {state:<10} {n}");
    }
    println!("  Conflicts: {}", result.conflicts);

    if result.usage_ratio >= SyncConfig::default().quota_warning_ratio {
        println!();
        println!("⚠ Storage nearly full; run `offsync compact`");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::Fixture;

    #[test]
    fn counts_records_and_changes() {
        let fixture = Fixture::new();
        let store = fixture.store();

        let result = inspect(fixture.path(), &store).unwrap();

        assert_eq!(result.collections.len(), 1);
        let tasks = &result.collections[0];
        assert_eq!(tasks.name, "tasks");
        assert_eq!(tasks.records, 2);
        assert_eq!(tasks.by_status.get("failed"), Some(&1));

        assert_eq!(result.changes.get("pending"), Some(&1));
        assert_eq!(result.changes.get("exhausted"), Some(&1));
        assert_eq!(result.conflicts, 0);
        assert!(result.journal_bytes > 0);
    }

    #[test]
    fn empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open_dir(dir.path(), Default::default()).unwrap());

        let result = inspect(dir.path(), &store).unwrap();
        assert!(result.collections.is_empty());
        assert!(result.changes.is_empty());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("journalBytes").is_some());
    }
}
