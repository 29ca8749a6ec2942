//! Pending command implementation.

use super::{open_ledger, open_store};
use offsync_protocol::{ChangeState, QueuedChange};
use offsync_storage::LocalStore;
use std::path::Path;
use std::sync::Arc;

/// Runs the pending command.
pub fn run(
    path: &Path,
    endpoint: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let changes = list(&store, endpoint)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        _ => {
            print_text_output(&changes);
        }
    }

    Ok(())
}

/// Queued changes in queue order, optionally of one endpoint.
pub fn list(
    store: &Arc<LocalStore>,
    endpoint: Option<&str>,
) -> Result<Vec<QueuedChange>, Box<dyn std::error::Error>> {
    let Some(ledger) = open_ledger(store)? else {
        return Ok(Vec::new());
    };
    let changes = match endpoint {
        Some(endpoint) => ledger.list_endpoint(endpoint)?,
        None => ledger.list_all()?,
    };
    Ok(changes)
}

fn print_text_output(changes: &[QueuedChange]) {
    if changes.is_empty() {
        println!("No queued changes");
        return;
    }

    println!(
        "{:<36}  {:<16} {:<7} {:<10} {:>7}  {:<12} ENQUEUED AT",
        "ID", "ENDPOINT", "METHOD", "STATE", "RETRIES", "RECORD"
    );
    for change in changes {
        let record = change
            .record_id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<16} {:<7} {:<10} {:>7}  {:<12} {}",
            change.id.to_string(),
            change.endpoint,
            change.method.as_str(),
            change.state.name(),
            change.retry_count,
            record,
            change.enqueued_at
        );
        if let ChangeState::Deferred { conflict_id } = change.state {
            println!("    held by conflict {conflict_id}");
        }
    }
    println!();
    println!("{} change(s)", changes.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixture::Fixture;

    #[test]
    fn lists_in_queue_order() {
        let fixture = Fixture::new();
        let store = fixture.store();

        let changes = list(&store, None).unwrap();
        let ids: Vec<_> = changes.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![fixture.updated.id, fixture.exhausted.id]);
    }

    #[test]
    fn filters_by_endpoint() {
        let fixture = Fixture::new();
        let store = fixture.store();

        assert_eq!(list(&store, Some("tasks")).unwrap().len(), 2);
        assert!(list(&store, Some("notes")).unwrap().is_empty());
    }

    #[test]
    fn store_without_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open_dir(dir.path(), Default::default()).unwrap());
        assert!(list(&store, None).unwrap().is_empty());
    }
}
