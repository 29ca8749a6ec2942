//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use offsync_protocol::{SyncBatchRequest, SyncBatchResponse};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

/// Sends batches of queued changes to the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, an in-process server, a mock for testing).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Sends one endpoint's batch and returns the server's answer.
    ///
    /// An `Err` means the whole batch failed; per-change outcomes are in the
    /// response.
    async fn send_batch(&self, request: SyncBatchRequest) -> SyncResult<SyncBatchResponse>;
}

/// A scripted reply for [`MockTransport`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Accept every change, echoing each payload back as the update.
    AcceptAll,
    /// Return this response.
    Respond(SyncBatchResponse),
    /// Fail with a retryable transport error.
    Fail(String),
    /// Never answer.
    Hang,
}

/// A mock transport for testing.
///
/// Replies are scripted per endpoint and consumed in order; once an
/// endpoint's script is empty the default reply is used.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    scripts: Mutex<HashMap<String, VecDeque<MockReply>>>,
    default_reply: Mutex<MockReply>,
    requests: Mutex<Vec<SyncBatchRequest>>,
}

impl MockTransport {
    /// Creates a mock that accepts everything.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            scripts: Mutex::new(HashMap::new()),
            default_reply: Mutex::new(MockReply::AcceptAll),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a reply for the next request to `endpoint`.
    pub fn push_reply(&self, endpoint: impl Into<String>, reply: MockReply) {
        self.scripts
            .lock()
            .entry(endpoint.into())
            .or_default()
            .push_back(reply);
    }

    /// Sets the reply used when no script applies.
    pub fn set_default_reply(&self, reply: MockReply) {
        *self.default_reply.lock() = reply;
    }

    /// Sets the connected state. A disconnected mock fails every request.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<SyncBatchRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn send_batch(&self, request: SyncBatchRequest) -> SyncResult<SyncBatchResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }

        self.requests.lock().push(request.clone());

        let reply = self
            .scripts
            .lock()
            .get_mut(&request.endpoint)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_reply.lock().clone());

        match reply {
            MockReply::AcceptAll => Ok(SyncBatchResponse::accepted(
                request.changes.iter().map(|c| c.id).collect(),
                request
                    .changes
                    .iter()
                    .filter(|c| c.record_id().is_some())
                    .map(|c| c.payload.clone())
                    .collect(),
            )),
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(message) => Err(SyncError::transport_retryable(message)),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{ChangeRequest, QueuedChange};
    use serde_json::json;

    fn request(endpoint: &str) -> SyncBatchRequest {
        SyncBatchRequest::new(
            endpoint,
            vec![QueuedChange::new(
                ChangeRequest::update(endpoint, json!({"id": 1, "v": 2})),
                0,
            )],
        )
    }

    #[tokio::test]
    async fn accepts_everything_by_default() {
        let transport = MockTransport::new();
        let req = request("tasks");
        let response = transport.send_batch(req.clone()).await.unwrap();

        assert_eq!(response.synced_ids, vec![req.changes[0].id]);
        assert_eq!(response.updates, vec![json!({"id": 1, "v": 2})]);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn scripts_are_per_endpoint() {
        let transport = MockTransport::new();
        transport.push_reply("tasks", MockReply::Fail("boom".into()));

        assert!(transport.send_batch(request("notes")).await.is_ok());
        let err = transport.send_batch(request("tasks")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(transport.send_batch(request("tasks")).await.is_ok());
    }

    #[tokio::test]
    async fn disconnected_mock_fails() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let result = transport.send_batch(request("tasks")).await;
        assert!(matches!(result, Err(SyncError::NotConnected)));
        assert_eq!(transport.request_count(), 0);
    }
}
