//! Host-to-guest RPC with the in-guest agent.
//!
//! Every call opens a new connection, writes one request frame, reads one
//! response frame and closes. Nothing is pooled and nothing is retried.
//!
//! Error mapping:
//! - connect failure, timeout, missing socket: `Transport`
//! - malformed body or `success: false`: `Protocol`
//! - checksum mismatch on file transfer: `Integrity`

mod connection;
pub mod protocol;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use capsule_shared::{CapsuleError, CapsuleResult, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::runtime::OsKind;
use crate::runtime::constants::guest;
use crate::util::checksum::{digests_match, sha256_bytes};
use protocol::{GuestRequest, GuestResponse, read_frame, write_frame};

mod commands {
    pub const PING: &str = "ping";
    pub const EXECUTE_COMMAND: &str = "execute_command";
    pub const UPLOAD_FILE: &str = "upload_file";
    pub const DOWNLOAD_FILE: &str = "download_file";
    pub const GET_SYSTEM_INFO: &str = "get_system_info";
    pub const GET_PROCESS_LIST: &str = "get_process_list";
    pub const HEALTH_CHECK: &str = "health_check";
    pub const SHUTDOWN: &str = "shutdown";
    pub const GET_SERVICES: &str = "get_services";
    pub const GET_EVENT_LOGS: &str = "get_event_logs";
}

/// Reply to `ping`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Options for [`GuestSession::execute_command`].
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Time the agent allows the command to run.
    pub timeout: Duration,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Outcome of a guest command. Returned as reported, even when `success` is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecFields {
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub path: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Deserialize)]
struct DownloadFields {
    content: String,
    checksum: String,
}

/// Client for one VM's guest agent.
#[derive(Debug, Clone)]
pub struct GuestSession {
    vm_name: String,
    transport: Transport,
    os: OsKind,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl GuestSession {
    pub fn new(vm_name: impl Into<String>, transport: Transport, os: OsKind) -> Self {
        Self {
            vm_name: vm_name.into(),
            transport,
            os,
            connect_timeout: Duration::from_secs(guest::CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(guest::COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, command_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.command_timeout = command_timeout;
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn os(&self) -> OsKind {
        self.os
    }

    async fn call(&self, command: &str, params: Map<String, Value>) -> CapsuleResult<GuestResponse> {
        self.call_with_timeout(command, params, self.command_timeout)
            .await
    }

    async fn call_with_timeout(
        &self,
        command: &str,
        params: Map<String, Value>,
        rpc_timeout: Duration,
    ) -> CapsuleResult<GuestResponse> {
        let request = GuestRequest::new(command, params);
        let payload = serde_json::to_vec(&request)?;

        tracing::debug!(
            vm = %self.vm_name,
            command,
            request_id = %request.request_id,
            transport = %self.transport,
            "Guest agent request"
        );

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, connection::connect(&self.transport))
                .await
            {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(CapsuleError::Transport(format!(
                        "connecting to {} timed out after {:?}",
                        self.transport, self.connect_timeout
                    )));
                }
            };

        let exchange = async {
            write_frame(&mut stream, &payload).await?;
            read_frame(&mut stream).await
        };
        let raw = match tokio::time::timeout(rpc_timeout, exchange).await {
            Ok(raw) => raw?,
            Err(_) => {
                return Err(CapsuleError::Transport(format!(
                    "agent {} on VM {} timed out after {:?}",
                    command, self.vm_name, rpc_timeout
                )));
            }
        };

        GuestResponse::decode(&raw)
    }

    fn require_windows(&self, command: &str) -> CapsuleResult<()> {
        if self.os == OsKind::Windows {
            Ok(())
        } else {
            Err(CapsuleError::Validation(format!(
                "{} is only available on Windows guests, VM {} runs {}",
                command, self.vm_name, self.os
            )))
        }
    }

    /// Agent liveness and version.
    pub async fn ping(&self) -> CapsuleResult<AgentInfo> {
        self.call(commands::PING, Map::new())
            .await?
            .ensure_success(commands::PING)?
            .fields_as(commands::PING)
    }

    /// Run a command in the guest.
    ///
    /// The RPC deadline is the larger of the session's command timeout and
    /// the command's own timeout plus a small margin.
    pub async fn execute_command(
        &self,
        command: &str,
        options: &ExecOptions,
    ) -> CapsuleResult<ExecResult> {
        let mut params = Map::new();
        params.insert("command".into(), json!(command));
        params.insert("timeout".into(), json!(options.timeout.as_secs()));
        if let Some(dir) = &options.working_dir {
            params.insert("working_dir".into(), json!(dir));
        }
        if !options.env.is_empty() {
            params.insert("env".into(), json!(options.env));
        }

        let rpc_timeout = self
            .command_timeout
            .max(options.timeout + Duration::from_secs(guest::EXEC_TIMEOUT_SLACK_SECS));
        let response = self
            .call_with_timeout(commands::EXECUTE_COMMAND, params, rpc_timeout)
            .await?;

        let fields: ExecFields = response.fields_as(commands::EXECUTE_COMMAND)?;
        Ok(ExecResult {
            success: response.success,
            exit_code: fields.exit_code.unwrap_or(-1),
            stdout: fields.stdout,
            stderr: fields.stderr,
            error: response.error,
        })
    }

    /// Copy a local file into the guest.
    ///
    /// The agent's reported checksum must match the local file's.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        create_dirs: bool,
        mode: u32,
    ) -> CapsuleResult<UploadResult> {
        let data = tokio::fs::read(local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CapsuleError::NotFound(format!("local file {}", local_path.display()))
            } else {
                CapsuleError::Io(e)
            }
        })?;
        let local_checksum = sha256_bytes(&data);

        let mut params = Map::new();
        params.insert("path".into(), json!(remote_path));
        params.insert("content".into(), json!(BASE64.encode(&data)));
        params.insert("create_dirs".into(), json!(create_dirs));
        params.insert("mode".into(), json!(mode));

        let result: UploadResult = self
            .call(commands::UPLOAD_FILE, params)
            .await?
            .ensure_success(commands::UPLOAD_FILE)?
            .fields_as(commands::UPLOAD_FILE)?;

        if !digests_match(&result.checksum, &local_checksum) {
            return Err(CapsuleError::Integrity(format!(
                "upload of {} to {}: agent checksum {} does not match local {}",
                local_path.display(),
                remote_path,
                result.checksum,
                local_checksum
            )));
        }

        tracing::info!(vm = %self.vm_name, remote = remote_path, size = result.size, "Uploaded file");
        Ok(result)
    }

    /// Copy a guest file to `local_path`.
    ///
    /// The decoded bytes are verified against the agent's SHA-256 before
    /// anything is written locally.
    pub async fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        max_size: Option<u64>,
    ) -> CapsuleResult<DownloadResult> {
        let max_size = max_size.unwrap_or(guest::DEFAULT_DOWNLOAD_MAX_BYTES);

        let mut params = Map::new();
        params.insert("path".into(), json!(remote_path));
        params.insert("max_size".into(), json!(max_size));

        let fields: DownloadFields = self
            .call(commands::DOWNLOAD_FILE, params)
            .await?
            .ensure_success(commands::DOWNLOAD_FILE)?
            .fields_as(commands::DOWNLOAD_FILE)?;

        let data = BASE64.decode(fields.content.as_bytes()).map_err(|e| {
            CapsuleError::Protocol(format!("download of {}: invalid base64: {}", remote_path, e))
        })?;
        if data.len() as u64 > max_size {
            return Err(CapsuleError::Protocol(format!(
                "download of {}: {} bytes exceeds the {} byte limit",
                remote_path,
                data.len(),
                max_size
            )));
        }

        let actual = sha256_bytes(&data);
        if !digests_match(&actual, &fields.checksum) {
            return Err(CapsuleError::Integrity(format!(
                "download of {}: expected checksum {}, got {}",
                remote_path, fields.checksum, actual
            )));
        }

        if let Some(parent) = local_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;

        tracing::info!(vm = %self.vm_name, remote = remote_path, size = data.len(), "Downloaded file");
        Ok(DownloadResult {
            path: local_path.to_path_buf(),
            size: data.len() as u64,
            checksum: actual,
        })
    }

    pub async fn get_system_info(&self) -> CapsuleResult<Value> {
        self.simple(commands::GET_SYSTEM_INFO, Map::new()).await
    }

    pub async fn get_process_list(&self) -> CapsuleResult<Value> {
        self.simple(commands::GET_PROCESS_LIST, Map::new()).await
    }

    pub async fn health_check(&self) -> CapsuleResult<Value> {
        self.simple(commands::HEALTH_CHECK, Map::new()).await
    }

    /// Ask the guest OS to shut down after `delay`.
    pub async fn shutdown(&self, force: bool, delay: Duration) -> CapsuleResult<()> {
        let mut params = Map::new();
        params.insert("force".into(), json!(force));
        params.insert("delay".into(), json!(delay.as_secs()));
        self.simple(commands::SHUTDOWN, params).await.map(|_| ())
    }

    /// Windows services. Windows guests only.
    pub async fn get_services(&self) -> CapsuleResult<Value> {
        self.require_windows(commands::GET_SERVICES)?;
        self.simple(commands::GET_SERVICES, Map::new()).await
    }

    /// Recent entries from a Windows event log. Windows guests only.
    pub async fn get_event_logs(&self, log_name: &str, max_events: u32) -> CapsuleResult<Value> {
        self.require_windows(commands::GET_EVENT_LOGS)?;
        let mut params = Map::new();
        params.insert("log_name".into(), json!(log_name));
        params.insert("max_events".into(), json!(max_events));
        self.simple(commands::GET_EVENT_LOGS, params).await
    }

    async fn simple(&self, command: &str, params: Map<String, Value>) -> CapsuleResult<Value> {
        Ok(self
            .call(command, params)
            .await?
            .ensure_success(command)?
            .into_value())
    }
}
