//! Error types shared across capsule crates.

use thiserror::Error;

/// Result alias used throughout capsule.
pub type CapsuleResult<T> = Result<T, CapsuleError>;

/// All errors surfaced by the capsule control plane.
///
/// Variants map one-to-one onto failure kinds callers are expected to handle:
/// - `Validation`, `InvalidState`: raised before any side effect
/// - `Protocol`, `Transport`: hypervisor or guest agent communication failures
/// - `Integrity`: checksum mismatch on transferred or stored data
#[derive(Debug, Error)]
pub enum CapsuleError {
    /// Bad name, resource request, or argument combination.
    #[error("validation error: {0}")]
    Validation(String),

    /// VM, snapshot, or template name is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A VM or snapshot with this name is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation is illegal for the current state (including calls on a
    /// hypervisor session that was never started).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Hypervisor or guest agent returned a malformed or rejected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket/pipe could not be located, connected, or timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// Checksum mismatch.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
