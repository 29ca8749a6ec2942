//! Integration tests for the sync engine and the reference server.

use async_trait::async_trait;
use offsync_engine::{
    ChangeRequest, ConflictPolicy, ConnectivityMonitor, HttpClient, HttpTransport,
    LoopbackClient, LoopbackServer, MockTransport, RetryConfig, SyncConfig, SyncController, SyncError,
    SyncObserver, SyncResult, SyncStatus, SyncTransport,
};
use offsync_protocol::{ChangeState, Conflict, SyncBatchRequest, SyncBatchResponse};
use offsync_server::{ServerConfig, SyncServer};
use offsync_storage::{LocalStore, ManualClock, StoreConfig};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A transport that calls an in-process server.
struct InMemoryTransport {
    server: Arc<SyncServer>,
}

#[async_trait]
impl SyncTransport for InMemoryTransport {
    async fn send_batch(&self, request: SyncBatchRequest) -> SyncResult<SyncBatchResponse> {
        self.server.handle_batch(request).map_err(|e| {
            if e.is_server_error() {
                SyncError::ServerError(e.to_string())
            } else {
                SyncError::transport_fatal(e.to_string())
            }
        })
    }
}

/// Exposes the server to [`LoopbackClient`].
struct ServerRoute(Arc<SyncServer>);

impl LoopbackServer for ServerRoute {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.0.handle_post(path, body)
    }
}

#[derive(Default)]
struct ConflictLog(Mutex<Vec<Conflict>>);

impl SyncObserver for ConflictLog {
    fn on_conflict(&self, conflict: &Conflict) {
        self.0.lock().push(conflict.clone());
    }
}

fn client(
    server: &Arc<SyncServer>,
    online: bool,
    config: SyncConfig,
) -> SyncController {
    SyncController::new(
        Arc::new(LocalStore::in_memory()),
        Arc::new(InMemoryTransport {
            server: Arc::clone(server),
        }),
        ConnectivityMonitor::new(online),
        config,
    )
    .unwrap()
}

fn server() -> Arc<SyncServer> {
    Arc::new(SyncServer::new(ServerConfig::default()).unwrap())
}

#[tokio::test]
async fn offline_update_reaches_the_server() {
    let server = server();
    let controller = client(&server, false, SyncConfig::default());

    let id = controller
        .queue_change(ChangeRequest::update("tasks", json!({"id": 7, "status": "done"})))
        .unwrap();
    assert_eq!(controller.sync_status().unwrap().pending_change_count, 1);
    assert_eq!(server.request_count(), 0);

    controller.connectivity().go_online();
    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.synced, vec![id]);

    let status = controller.sync_status().unwrap();
    assert_eq!(status.pending_change_count, 0);
    assert!(status.last_sync_time.is_some());

    let local = controller.get_local_data("tasks", 7).unwrap().unwrap();
    assert_eq!(local.sync_status, Some(SyncStatus::Synced));
    assert_eq!(local.get("status"), Some(&json!("done")));
    assert_eq!(local.get("version"), Some(&json!(1)));

    let remote = server.get_record("tasks", 7).unwrap().unwrap();
    assert_eq!(remote.get("status"), Some(&json!("done")));
}

async fn create_shared_record(server: &Arc<SyncServer>, controller: &SyncController) {
    controller
        .queue_change(ChangeRequest::create("tasks", json!({"id": 42, "title": "draft"})))
        .unwrap();
    controller.sync_now().await.unwrap();

    // Another client edits the record.
    server
        .put_record("tasks", json!({"id": 42, "title": "theirs"}))
        .unwrap();

    controller
        .queue_change(ChangeRequest::update("tasks", json!({"id": 42, "title": "mine"})))
        .unwrap();
}

#[tokio::test]
async fn concurrent_edit_under_manual_policy() {
    let server = server();
    let controller = client(
        &server,
        true,
        SyncConfig::default().with_conflict_policy(ConflictPolicy::Manual),
    );
    let log = Arc::new(ConflictLog::default());
    controller.add_observer(log.clone());

    create_shared_record(&server, &controller).await;
    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(log.0.lock().len(), 1);

    // Neither deleted nor resent while unresolved.
    let requests = server.request_count();
    controller.sync_now().await.unwrap();
    controller.sync_now().await.unwrap();
    assert_eq!(server.request_count(), requests);
    assert_eq!(controller.ledger().count().unwrap(), 1);
    assert_eq!(log.0.lock().len(), 1);

    let conflict = controller.pending_conflicts().unwrap().remove(0);
    assert_eq!(conflict.server_version["title"], json!("theirs"));
    assert_eq!(conflict.server_version["version"], json!(2));

    controller.resend_client(conflict.id).unwrap();
    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.synced.len(), 1);

    let remote = server.get_record("tasks", 42).unwrap().unwrap();
    assert_eq!(remote.get("title"), Some(&json!("mine")));
    assert_eq!(remote.get("version"), Some(&json!(3)));
    let local = controller.get_local_data("tasks", 42).unwrap().unwrap();
    assert_eq!(local.sync_status, Some(SyncStatus::Synced));
    assert_eq!(local.get("version"), Some(&json!(3)));
}

#[tokio::test]
async fn concurrent_edit_server_wins() {
    let server = server();
    let controller = client(&server, true, SyncConfig::default());

    create_shared_record(&server, &controller).await;
    controller.sync_now().await.unwrap();

    assert_eq!(controller.ledger().count().unwrap(), 0);
    let local = controller.get_local_data("tasks", 42).unwrap().unwrap();
    assert_eq!(local.get("title"), Some(&json!("theirs")));
    assert_eq!(local.get("version"), Some(&json!(2)));

    let remote = server.get_record("tasks", 42).unwrap().unwrap();
    assert_eq!(remote.get("title"), Some(&json!("theirs")));
}

#[tokio::test]
async fn concurrent_edit_client_wins() {
    let server = server();
    let controller = client(
        &server,
        true,
        SyncConfig::default().with_conflict_policy(ConflictPolicy::ClientWins),
    );

    create_shared_record(&server, &controller).await;
    let first = controller.sync_now().await.unwrap();
    assert_eq!(first.conflicts.len(), 1);
    assert_eq!(controller.ledger().count().unwrap(), 1);

    let second = controller.sync_now().await.unwrap();
    assert_eq!(second.synced.len(), 1);
    assert_eq!(controller.ledger().count().unwrap(), 0);

    let remote = server.get_record("tasks", 42).unwrap().unwrap();
    assert_eq!(remote.get("title"), Some(&json!("mine")));
}

#[tokio::test]
async fn offline_edit_chain_does_not_conflict() {
    let server = server();
    let controller = client(&server, true, SyncConfig::default());
    controller
        .queue_change(ChangeRequest::create("tasks", json!({"id": 1, "title": "a"})))
        .unwrap();
    controller.sync_now().await.unwrap();

    controller.connectivity().go_offline();
    for step in 0..3 {
        controller
            .queue_change(ChangeRequest::update("tasks", json!({"id": 1, "step": step})))
            .unwrap();
    }
    controller.connectivity().go_online();

    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.synced.len(), 3);
    assert!(result.conflicts.is_empty());

    let remote = server.get_record("tasks", 1).unwrap().unwrap();
    assert_eq!(remote.get("step"), Some(&json!(2)));
    assert_eq!(remote.get("version"), Some(&json!(4)));
}

#[tokio::test]
async fn server_outage_backs_off_then_recovers() {
    let server = server();
    let clock = Arc::new(ManualClock::new(0));
    let controller = client(
        &server,
        true,
        SyncConfig::default()
            .with_retry(RetryConfig::new(3).with_retry_delay(Duration::from_millis(100)))
            .with_clock(clock.clone()),
    );
    controller
        .queue_change(ChangeRequest::create("notes", json!({"id": "n1", "body": "hi"})))
        .unwrap();

    server.fail_next(1);
    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.failed.len(), 1);
    assert_eq!(controller.next_backoff_deadline().unwrap(), Some(200));

    clock.advance(200);
    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.synced.len(), 1);
    assert!(server.get_record("notes", "n1").unwrap().is_some());
}

#[tokio::test]
async fn http_transport_over_loopback() {
    let server = server();
    let transport = HttpTransport::new(
        "https://api.example.com",
        LoopbackClient::new(ServerRoute(Arc::clone(&server))),
    );
    let controller = SyncController::new(
        Arc::new(LocalStore::in_memory()),
        Arc::new(transport),
        ConnectivityMonitor::new(true),
        SyncConfig::default(),
    )
    .unwrap();

    controller
        .queue_change(ChangeRequest::create("tasks", json!({"id": 1, "title": "a"})))
        .unwrap();
    controller
        .queue_change(ChangeRequest::create("notes", json!({"id": "x", "body": "b"})))
        .unwrap();

    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.synced.len(), 2);
    assert_eq!(server.record_count("tasks").unwrap(), 1);
    assert_eq!(server.record_count("notes").unwrap(), 1);
}

/// Answers every request with a login page instead of the API.
struct CaptivePortal;

#[async_trait]
impl HttpClient for CaptivePortal {
    async fn post(&self, _url: &str, _body: Vec<u8>) -> Result<Vec<u8>, String> {
        Ok(b"<html>captive portal login</html>".to_vec())
    }
}

#[tokio::test]
async fn captive_portal_page_is_retried() {
    let controller = SyncController::new(
        Arc::new(LocalStore::in_memory()),
        Arc::new(HttpTransport::new("https://api.example.com", CaptivePortal)),
        ConnectivityMonitor::new(true),
        SyncConfig::default(),
    )
    .unwrap();
    let id = controller
        .queue_change(ChangeRequest::update("tasks", json!({"id": 1, "title": "a"})))
        .unwrap();

    let result = controller.sync_now().await.unwrap();
    assert_eq!(result.failed, vec![id]);
    assert!(result.exhausted.is_empty());
    assert!(controller.sync_errors().is_empty());

    let change = controller.ledger().get(id).unwrap().unwrap();
    assert_eq!(change.state, ChangeState::Pending);
    assert_eq!(change.retry_count, 1);
    assert!(change.next_attempt_at.is_some());
    let local = controller.get_local_data("tasks", 1).unwrap().unwrap();
    assert_eq!(local.sync_status, Some(SyncStatus::Pending));
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = server();

    {
        let store = LocalStore::open_dir(dir.path(), StoreConfig::default()).unwrap();
        let controller = SyncController::new(
            Arc::new(store),
            Arc::new(MockTransport::new()),
            ConnectivityMonitor::new(false),
            SyncConfig::default(),
        )
        .unwrap();
        controller
            .queue_change(ChangeRequest::update("tasks", json!({"id": 3, "title": "x"})))
            .unwrap();
    }

    let store = LocalStore::open_dir(dir.path(), StoreConfig::default()).unwrap();
    let controller = SyncController::new(
        Arc::new(store),
        Arc::new(InMemoryTransport {
            server: Arc::clone(&server),
        }),
        ConnectivityMonitor::new(true),
        SyncConfig::default(),
    )
    .unwrap();

    assert_eq!(controller.sync_status().unwrap().pending_change_count, 1);
    let local = controller.get_local_data("tasks", 3).unwrap().unwrap();
    assert!(local.is_pending());

    controller.sync_now().await.unwrap();
    assert_eq!(controller.sync_status().unwrap().pending_change_count, 0);
    assert!(server.get_record("tasks", 3).unwrap().is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn offline_sequences_are_sent_in_order(
        steps in prop::collection::vec((0usize..3, 0i64..5, 0i64..3), 1..20)
    ) {
        let endpoints = ["tasks", "notes", "tags"];
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(0));
            let transport = Arc::new(MockTransport::new());
            let controller = SyncController::new(
                Arc::new(LocalStore::in_memory()),
                transport.clone(),
                ConnectivityMonitor::new(false),
                SyncConfig::default().with_clock(clock.clone()),
            )
            .unwrap();

            let mut queued = Vec::new();
            for (endpoint, record, delay) in &steps {
                clock.advance(*delay);
                let endpoint = endpoints[*endpoint];
                let id = controller
                    .queue_change(ChangeRequest::update(endpoint, json!({"id": record})))
                    .unwrap();
                queued.push((endpoint, id));
            }

            let ledger: Vec<_> = controller.ledger().list_all().unwrap().iter().map(|c| c.id).collect();
            let expected: Vec<_> = queued.iter().map(|(_, id)| *id).collect();
            assert_eq!(ledger, expected);

            controller.connectivity().go_online();
            controller.sync_now().await.unwrap();
            assert_eq!(controller.ledger().count().unwrap(), 0);

            for request in transport.requests() {
                let sent: Vec<_> = request.changes.iter().map(|c| c.id).collect();
                let expected: Vec<_> = queued
                    .iter()
                    .filter(|(endpoint, _)| *endpoint == request.endpoint)
                    .map(|(_, id)| *id)
                    .collect();
                assert_eq!(sent, expected);
            }
        });
    }
}
