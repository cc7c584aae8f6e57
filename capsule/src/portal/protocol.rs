//! Guest agent wire format.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8 JSON. One request frame and one response frame per connection.

use capsule_shared::constants::guest_protocol::{LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES};
use capsule_shared::{CapsuleError, CapsuleResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestRequest {
    pub command: String,
    pub params: Map<String, Value>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl GuestRequest {
    pub fn new(command: &str, params: Map<String, Value>) -> Self {
        Self {
            command: command.to_string(),
            params,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Agent reply: a success flag, an optional error, and command-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl GuestResponse {
    pub fn decode(raw: &[u8]) -> CapsuleResult<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| CapsuleError::Protocol(format!("malformed agent response: {}", e)))
    }

    /// Turn an agent-reported failure into a `Protocol` error.
    pub fn ensure_success(self, command: &str) -> CapsuleResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(CapsuleError::Protocol(format!(
                "agent {} failed: {}",
                command,
                self.error.as_deref().unwrap_or("no error message")
            )))
        }
    }

    /// Deserialize the command-specific fields.
    pub fn fields_as<T: DeserializeOwned>(&self, command: &str) -> CapsuleResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            CapsuleError::Protocol(format!("unexpected {} response shape: {}", command, e))
        })
    }

    /// The command-specific fields as a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> CapsuleResult<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CapsuleError::Protocol(format!(
            "request frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    let len = payload.len() as u32;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(io_transport)?;
    writer.write_all(payload).await.map_err(io_transport)?;
    writer.flush().await.map_err(io_transport)
}

pub async fn read_frame<R>(reader: &mut R) -> CapsuleResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut prefix).await.map_err(io_transport)?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CapsuleError::Protocol(format!(
            "response frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(io_transport)?;
    Ok(payload)
}

fn io_transport(e: std::io::Error) -> CapsuleError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CapsuleError::Transport("agent closed the connection mid-frame".into())
    } else {
        CapsuleError::Transport(format!("agent channel I/O failed: {}", e))
    }
}
