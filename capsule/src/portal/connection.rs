//! Transport-specific stream setup for guest agent calls.

use std::path::Path;

use capsule_shared::{CapsuleError, CapsuleResult, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Byte stream to the guest agent, independent of transport.
pub(crate) trait GuestStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> GuestStream for T {}

/// Longest acknowledgement line accepted from the hybrid vsock multiplexer.
const MAX_HANDSHAKE_LINE: usize = 64;

/// Open a fresh connection for exactly one request/response exchange.
pub(crate) async fn connect(transport: &Transport) -> CapsuleResult<Box<dyn GuestStream>> {
    match transport {
        Transport::Unix { socket_path } => Ok(Box::new(open_socket(socket_path).await?)),
        Transport::HybridVsock { socket_path, port } => {
            let mut stream = open_socket(socket_path).await?;
            vsock_handshake(&mut stream, *port).await?;
            Ok(Box::new(stream))
        }
        Transport::NamedPipe { pipe_name } => connect_pipe(pipe_name),
    }
}

async fn open_socket(socket_path: &Path) -> CapsuleResult<UnixStream> {
    if !socket_path.exists() {
        return Err(CapsuleError::Transport(format!(
            "guest socket {} does not exist",
            socket_path.display()
        )));
    }
    UnixStream::connect(socket_path).await.map_err(|e| {
        CapsuleError::Transport(format!(
            "Failed to connect to guest socket {}: {}",
            socket_path.display(),
            e
        ))
    })
}

/// Ask the hypervisor's vsock multiplexer for `port`.
///
/// It answers `OK <host port>\n` once the guest side accepted; from then on
/// the stream carries agent frames. Anything else means the agent is not
/// listening.
async fn vsock_handshake(stream: &mut UnixStream, port: u32) -> CapsuleResult<()> {
    stream
        .write_all(format!("CONNECT {}\n", port).as_bytes())
        .await
        .map_err(|e| CapsuleError::Transport(format!("vsock CONNECT {} failed: {}", port, e)))?;

    // Byte at a time so no agent data past the newline is consumed.
    let mut line = Vec::with_capacity(MAX_HANDSHAKE_LINE);
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            CapsuleError::Transport(format!("vsock port {} closed during handshake: {}", port, e))
        })?;
        if byte == b'\n' {
            break;
        }
        if line.len() == MAX_HANDSHAKE_LINE {
            return Err(CapsuleError::Transport(format!(
                "vsock port {} handshake reply too long",
                port
            )));
        }
        line.push(byte);
    }

    let reply = String::from_utf8_lossy(&line);
    if reply == "OK" || reply.starts_with("OK ") {
        tracing::trace!(port, reply = %reply, "vsock handshake complete");
        Ok(())
    } else {
        Err(CapsuleError::Transport(format!(
            "vsock port {} refused: {}",
            port,
            reply.trim()
        )))
    }
}

#[cfg(windows)]
fn connect_pipe(pipe_name: &str) -> CapsuleResult<Box<dyn GuestStream>> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let client = ClientOptions::new().open(pipe_name).map_err(|e| {
        CapsuleError::Transport(format!("Failed to open named pipe {}: {}", pipe_name, e))
    })?;
    Ok(Box::new(client))
}

#[cfg(not(windows))]
fn connect_pipe(pipe_name: &str) -> CapsuleResult<Box<dyn GuestStream>> {
    Err(CapsuleError::Transport(format!(
        "named pipe {} is only reachable from a Windows host",
        pipe_name
    )))
}
