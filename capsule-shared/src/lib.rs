//! Types shared between the capsule control plane and its consumers.

pub mod constants;
pub mod errors;
pub mod transport;

pub use errors::{CapsuleError, CapsuleResult};
pub use transport::Transport;
