//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, a platform fetch API, etc.).

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use offsync_protocol::{SyncBatchRequest, SyncBatchResponse};
use parking_lot::RwLock;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body and returns the response body.
    ///
    /// An `Err` is a network-level failure or a non-success status.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// HTTP-based sync transport.
///
/// Each endpoint's batch is posted as JSON to `{base_url}/{endpoint}/sync`.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the API (e.g., "https://api.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// URL a batch for `endpoint` is posted to.
    pub fn sync_url(&self, endpoint: &str) -> String {
        format!("{}/{}/sync", self.base_url, endpoint.trim_matches('/'))
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn send_batch(&self, request: SyncBatchRequest) -> SyncResult<SyncBatchResponse> {
        let body = request.encode()?;
        let url = self.sync_url(&request.endpoint);

        let response_body = self.client.post(&url, body).await.map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            SyncError::transport_retryable(e)
        })?;

        // Captive portals and proxies answer with pages that are not batch
        // responses; those are retried like a network failure.
        match SyncBatchResponse::decode(&response_body) {
            Ok(response) => {
                *self.last_error.write() = None;
                Ok(response)
            }
            Err(e) => {
                let message = format!("unreadable response from {url}: {e}");
                *self.last_error.write() = Some(message.clone());
                Err(SyncError::transport_retryable(message))
            }
        }
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        // Strip scheme and host; the server routes on the path.
        let path = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.find('/').map(|i| &rest[i..]))
            .unwrap_or(url);

        self.server.handle_post(path, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::{ChangeRequest, QueuedChange};
    use parking_lot::Mutex;
    use serde_json::json;

    struct TestClient {
        response: Mutex<Option<Vec<u8>>>,
        urls: Mutex<Vec<String>>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: Mutex::new(None),
                urls: Mutex::new(Vec::new()),
            }
        }

        fn set_response(&self, resp: Vec<u8>) {
            *self.response.lock() = Some(resp);
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn post(&self, url: &str, _body: Vec<u8>) -> Result<Vec<u8>, String> {
            self.urls.lock().push(url.to_string());
            self.response
                .lock()
                .clone()
                .ok_or_else(|| "connection refused".into())
        }
    }

    fn request() -> SyncBatchRequest {
        SyncBatchRequest::new(
            "tasks",
            vec![QueuedChange::new(
                ChangeRequest::update("tasks", json!({"id": 7})),
                0,
            )],
        )
    }

    #[test]
    fn url_layout() {
        let transport = HttpTransport::new("https://api.example.com/", TestClient::new());
        assert_eq!(transport.base_url(), "https://api.example.com");
        assert_eq!(
            transport.sync_url("tasks"),
            "https://api.example.com/tasks/sync"
        );
    }

    #[tokio::test]
    async fn posts_and_decodes() {
        let client = TestClient::new();
        let req = request();
        client.set_response(
            SyncBatchResponse::accepted(vec![req.changes[0].id], vec![json!({"id": 7})])
                .encode()
                .unwrap(),
        );

        let transport = HttpTransport::new("https://api.example.com", client);
        let response = transport.send_batch(req.clone()).await.unwrap();
        assert_eq!(response.synced_ids, vec![req.changes[0].id]);
        assert_eq!(
            transport.client.urls.lock().as_slice(),
            ["https://api.example.com/tasks/sync".to_string()]
        );
    }

    #[tokio::test]
    async fn network_failure_is_retryable() {
        let transport = HttpTransport::new("https://api.example.com", TestClient::new());
        let err = transport.send_batch(request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn unreadable_body_is_retryable() {
        let client = TestClient::new();
        client.set_response(b"<html>captive portal login</html>".to_vec());
        let transport = HttpTransport::new("https://api.example.com", client);

        let err = transport.send_batch(request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: true, .. }));
        assert!(err.is_retryable());
        assert!(transport
            .last_error()
            .is_some_and(|e| e.contains("https://api.example.com/tasks/sync")));
    }

    struct Echo;

    impl LoopbackServer for Echo {
        fn handle_post(&self, path: &str, _body: &[u8]) -> Result<Vec<u8>, String> {
            Ok(path.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn loopback_routes_on_path() {
        let client = LoopbackClient::new(Echo);
        let body = client
            .post("https://api.example.com/tasks/sync", Vec::new())
            .await
            .unwrap();
        assert_eq!(body, b"/tasks/sync");
    }
}
