use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Host-side endpoint of a guest agent channel.
///
/// Linux guests are reached through the hypervisor's hybrid vsock socket,
/// which needs a `CONNECT <port>` handshake before the agent is on the line.
/// Windows guests are reached through a named pipe. `Unix` is a plain socket
/// with the agent directly behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    Unix { socket_path: PathBuf },
    HybridVsock { socket_path: PathBuf, port: u32 },
    NamedPipe { pipe_name: String },
}

impl Transport {
    pub fn unix(socket_path: impl Into<PathBuf>) -> Self {
        Transport::Unix {
            socket_path: socket_path.into(),
        }
    }

    pub fn hybrid_vsock(socket_path: impl Into<PathBuf>, port: u32) -> Self {
        Transport::HybridVsock {
            socket_path: socket_path.into(),
            port,
        }
    }

    pub fn named_pipe(pipe_name: impl Into<String>) -> Self {
        Transport::NamedPipe {
            pipe_name: pipe_name.into(),
        }
    }

    /// Socket path for socket-based transports.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Transport::Unix { socket_path } | Transport::HybridVsock { socket_path, .. } => {
                Some(socket_path)
            }
            Transport::NamedPipe { .. } => None,
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Transport::Unix { socket_path } => format!("unix://{}", socket_path.display()),
            Transport::HybridVsock { socket_path, port } => {
                format!("vsock://{}:{}", socket_path.display(), port)
            }
            Transport::NamedPipe { pipe_name } => format!("pipe://{}", pipe_name),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
