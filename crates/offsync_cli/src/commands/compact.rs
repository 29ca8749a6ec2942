//! Compact command implementation.

use super::open_store;
use offsync_storage::LocalStore;
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Journal size before compaction.
    pub bytes_before: u64,
    /// Journal size after compaction. Equal to `bytes_before` on a dry run.
    pub bytes_after: u64,
}

impl CompactStats {
    /// Bytes reclaimed.
    pub fn saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    println!("Compacting journal at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(&store, dry_run)?;

    println!("  Size before: {} bytes", stats.bytes_before);
    if dry_run {
        println!("  Collections: {}", store.collections().len());
        return Ok(());
    }
    println!("  Size after:  {} bytes", stats.bytes_after);
    println!(
        "  Space saved: {} bytes ({:.1}%)",
        stats.saved(),
        if stats.bytes_before > 0 {
            (stats.saved() as f64 / stats.bytes_before as f64) * 100.0
        } else {
            0.0
        }
    );
    println!();
    println!("✓ Compaction complete");

    Ok(())
}

/// Rewrites the journal of an open store, unless `dry_run` is set.
pub fn compact(
    store: &LocalStore,
    dry_run: bool,
) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let bytes_before = store.estimate()?.usage;
    if dry_run {
        return Ok(CompactStats {
            bytes_before,
            bytes_after: bytes_before,
        });
    }
    store.compact()?;
    Ok(CompactStats {
        bytes_before,
        bytes_after: store.estimate()?.usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::Fixture;
    use offsync_engine::ChangeLedger;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn dry_run_leaves_journal_alone() {
        let fixture = Fixture::new();
        let store = fixture.store();
        let before = store.estimate().unwrap().usage;

        let stats = compact(&store, true).unwrap();
        assert_eq!(stats.bytes_before, before);
        assert_eq!(stats.saved(), 0);
        assert_eq!(store.estimate().unwrap().usage, before);
    }

    #[test]
    fn reclaims_overwritten_records() {
        let fixture = Fixture::new();
        {
            let store = fixture.store();
            for n in 0..20 {
                store.put("tasks", json!({"id": 2, "title": format!("edit {n}")})).unwrap();
            }
            let stats = compact(&store, false).unwrap();
            assert!(stats.bytes_after < stats.bytes_before);
        }

        let store = fixture.store();
        let record = store.get("tasks", 2).unwrap().unwrap();
        assert_eq!(record.get("title"), Some(&json!("edit 19")));
        let ledger = ChangeLedger::open(Arc::clone(&store)).unwrap();
        assert_eq!(ledger.count().unwrap(), 2);
    }
}
