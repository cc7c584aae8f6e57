//! HTTP/1.1 client for the hypervisor control socket.
//!
//! Every request opens a fresh Unix stream connection. The control API is
//! low-traffic and this keeps a dead connection from poisoning later calls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use capsule_shared::{CapsuleError, CapsuleResult};
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::UnixStream;

use crate::runtime::constants::hypervisor::API_REQUEST_TIMEOUT_SECS;

/// Control API operation names (the path suffix after `/api/v1/`).
pub(crate) mod ops {
    pub const VM_CREATE: &str = "vm.create";
    pub const VM_BOOT: &str = "vm.boot";
    pub const VM_SHUTDOWN: &str = "vm.shutdown";
    pub const VM_PAUSE: &str = "vm.pause";
    pub const VM_RESUME: &str = "vm.resume";
    pub const VM_RESIZE: &str = "vm.resize";
    pub const VM_SNAPSHOT: &str = "vm.snapshot";
    pub const VM_RESTORE: &str = "vm.restore";
    pub const VM_INFO: &str = "vm.info";
    pub const VM_COUNTERS: &str = "vm.counters";
    pub const VMM_PING: &str = "vmm.ping";
}

#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout: Duration::from_secs(API_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Bound every request made through this client by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `PUT /api/v1/<op>` with an optional JSON body.
    pub async fn put(&self, op: &str, body: Option<&Value>) -> CapsuleResult<Option<Value>> {
        let body = match body {
            Some(v) => Bytes::from(serde_json::to_vec(v)?),
            None => Bytes::new(),
        };
        self.request(Method::PUT, op, body).await
    }

    /// `GET /api/v1/<op>`.
    pub async fn get(&self, op: &str) -> CapsuleResult<Option<Value>> {
        self.request(Method::GET, op, Bytes::new()).await
    }

    /// Liveness check used while waiting for a freshly spawned hypervisor.
    pub async fn ping(&self) -> CapsuleResult<()> {
        self.get(ops::VMM_PING).await.map(|_| ())
    }

    async fn request(&self, method: Method, op: &str, body: Bytes) -> CapsuleResult<Option<Value>> {
        tracing::trace!(%method, op, socket = %self.socket_path.display(), "Hypervisor API request");

        match tokio::time::timeout(self.timeout, self.round_trip(method, op, body)).await {
            Ok(result) => result,
            Err(_) => Err(CapsuleError::Transport(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }

    async fn round_trip(
        &self,
        method: Method,
        op: &str,
        body: Bytes,
    ) -> CapsuleResult<Option<Value>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            CapsuleError::Transport(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| CapsuleError::Transport(format!("HTTP handshake failed: {}", e)))?;

        let conn_task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::trace!(error = %e, "Hypervisor API connection closed");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("/api/v1/{}", op))
            .header(HOST, "localhost")
            .header(ACCEPT, "application/json");
        if !body.is_empty() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| CapsuleError::Internal(format!("Invalid request for {}: {}", op, e)))?;

        let result = async {
            let response = sender
                .send_request(request)
                .await
                .map_err(|e| CapsuleError::Transport(format!("{} request failed: {}", op, e)))?;

            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| CapsuleError::Transport(format!("{} response body: {}", op, e)))?
                .to_bytes();

            if !status.is_success() {
                let detail = String::from_utf8_lossy(&bytes);
                return Err(CapsuleError::Protocol(format!(
                    "{} rejected with HTTP {}: {}",
                    op,
                    status.as_u16(),
                    detail.trim()
                )));
            }

            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(None);
            }
            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CapsuleError::Protocol(format!("{} returned invalid JSON: {}", op, e)))
        }
        .await;

        conn_task.abort();
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_server::serve;
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_sends_json_body() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let log = serve(&socket, |_, _| (204, String::new()));

        let client = ApiClient::new(&socket);
        let reply = client
            .put(ops::VM_RESIZE, Some(&json!({"desired_vcpus": 4})))
            .await
            .unwrap();
        assert!(reply.is_none());

        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].method, "PUT");
        assert_eq!(log[0].path, "/api/v1/vm.resize");
        let body: Value = serde_json::from_str(&log[0].body).unwrap();
        assert_eq!(body["desired_vcpus"], 4);
    }

    #[tokio::test]
    async fn test_get_parses_json() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        serve(&socket, |_, _| (200, r#"{"state":"Running"}"#.to_string()));

        let info = ApiClient::new(&socket).get(ops::VM_INFO).await.unwrap();
        assert_eq!(info, Some(json!({"state": "Running"})));
    }

    #[tokio::test]
    async fn test_non_success_status_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        serve(&socket, |_, _| (500, "VM is not booted".to_string()));

        let err = ApiClient::new(&socket)
            .put(ops::VM_PAUSE, None)
            .await
            .unwrap_err();
        match err {
            CapsuleError::Protocol(msg) => {
                assert!(msg.contains("500"));
                assert!(msg.contains("VM is not booted"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        serve(&socket, |_, _| (200, "not json".to_string()));

        let err = ApiClient::new(&socket).get(ops::VM_COUNTERS).await.unwrap_err();
        assert!(matches!(err, CapsuleError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let err = ApiClient::new(&dir.path().join("nope.sock"))
            .ping()
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unresponsive_server_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        // Accepts but never answers.
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let err = ApiClient::new(&socket)
            .with_timeout(Duration::from_millis(200))
            .ping()
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Transport(_)));
    }
}
