//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::records::RecordTable;
use offsync_protocol::{SyncBatchRequest, SyncBatchResponse};
use offsync_storage::{Document, LocalStore, RecordKey};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// The sync server.
///
/// Accepts one batch per endpoint at `/{endpoint}/sync`, applies it with
/// version checks and answers with the accepted ids, the resulting records
/// and any conflicts.
///
/// # Example
///
/// ```
/// use offsync_protocol::{ChangeRequest, QueuedChange, SyncBatchRequest};
/// use offsync_server::{ServerConfig, SyncServer};
/// use serde_json::json;
///
/// let server = SyncServer::new(ServerConfig::default()).unwrap();
/// let change = QueuedChange::new(ChangeRequest::create("tasks", json!({"id": 1})), 0);
///
/// let response = server
///     .handle_batch(SyncBatchRequest::new("tasks", vec![change.clone()]))
///     .unwrap();
/// assert_eq!(response.synced_ids, vec![change.id]);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    fail_next: AtomicUsize,
    requests: AtomicU64,
}

impl SyncServer {
    /// Creates a server with an in-memory record table.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Ok(Self::with_records(config, RecordTable::new()?))
    }

    /// Creates a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<LocalStore>) -> ServerResult<Self> {
        Ok(Self::with_records(config, RecordTable::with_store(store)?))
    }

    fn with_records(config: ServerConfig, records: RecordTable) -> Self {
        Self {
            handler: RequestHandler::new(config, records),
            fail_next: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Applies one batch.
    pub fn handle_batch(&self, request: SyncBatchRequest) -> ServerResult<SyncBatchResponse> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.take_injected_failure()?;
        self.handler.handle_batch(request)
    }

    /// Handles a POST with a JSON body, routing on the path.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.route(path, body).map_err(|e| {
            tracing::warn!(%path, error = %e, "request failed");
            e.to_string()
        })
    }

    fn route(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let endpoint =
            sync_route(path).ok_or_else(|| ServerError::UnknownRoute(path.to_string()))?;
        let request = SyncBatchRequest::decode(body)?;
        if request.endpoint != endpoint {
            return Err(ServerError::InvalidRequest(format!(
                "batch for {} posted to {path}",
                request.endpoint
            )));
        }
        Ok(self.handle_batch(request)?.encode()?)
    }

    fn take_injected_failure(&self) -> ServerResult<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ServerError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    /// Makes the next `n` batches fail with [`ServerError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of batches received, failed ones included.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Writes a record as another client would, bumping its version.
    pub fn put_record(&self, endpoint: &str, record: Value) -> ServerResult<Document> {
        self.handler.records().put(endpoint, record)
    }

    /// Deletes a record as another client would.
    pub fn delete_record(&self, endpoint: &str, id: impl Into<RecordKey>) -> ServerResult<bool> {
        self.handler.records().delete(endpoint, &id.into())
    }

    /// Current server copy of a record.
    pub fn get_record(
        &self,
        endpoint: &str,
        id: impl Into<RecordKey>,
    ) -> ServerResult<Option<Document>> {
        self.handler.records().get(endpoint, &id.into())
    }

    /// Number of records of an endpoint.
    pub fn record_count(&self, endpoint: &str) -> ServerResult<usize> {
        self.handler.records().count(endpoint)
    }
}

/// Extracts the endpoint from a `/{endpoint}/sync` path.
fn sync_route(path: &str) -> Option<&str> {
    let endpoint = path.trim_start_matches('/').strip_suffix("/sync")?;
    (!endpoint.is_empty() && !endpoint.contains('/')).then_some(endpoint)
}
