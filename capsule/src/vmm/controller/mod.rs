//! Hypervisor process control.
//!
//! ## Architecture
//!
//! - **VmmController**: the seam between VM lifecycle/snapshot logic and the
//!   hypervisor. One controller serves every VM; per-VM sessions live inside it.
//! - **CloudHypervisorController**: spawns one hypervisor subprocess per VM and
//!   drives it over its HTTP control socket.
//!
//! Operations other than `start` and `stop` require a live session for the VM
//! and fail with `InvalidState` otherwise. They are never retried.

mod cloud_hypervisor;
#[cfg(test)]
pub(crate) mod fake;
mod session;
mod spawn;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capsule_shared::CapsuleResult;
use serde_json::Value;

pub use cloud_hypervisor::CloudHypervisorController;

use crate::runtime::CapsuleOptions;
use crate::vmm::{ResizeRequest, VmmConfig};

/// Process supervision knobs shared by every session.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub binary: PathBuf,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub stop_grace: Duration,
}

impl ControllerSettings {
    pub fn from_options(options: &CapsuleOptions) -> Self {
        Self {
            binary: options.hypervisor_binary.clone(),
            ready_attempts: options.socket_ready_attempts,
            ready_interval: options.socket_ready_interval(),
            stop_grace: options.stop_grace_period(),
        }
    }
}

/// Control surface of a hypervisor.
#[async_trait::async_trait]
pub trait VmmController: Send + Sync {
    /// Start a hypervisor process for `config.vm_name` and wait for its
    /// control socket. A no-op if a live session already exists.
    async fn start(&self, config: &VmmConfig) -> CapsuleResult<()>;

    /// Send the full VM descriptor (`vm.create`).
    async fn create(&self, config: &VmmConfig) -> CapsuleResult<()>;

    async fn boot(&self, vm: &str) -> CapsuleResult<()>;

    /// Ask the guest to shut down (`vm.shutdown`). The process keeps running.
    async fn shutdown(&self, vm: &str) -> CapsuleResult<()>;

    async fn pause(&self, vm: &str) -> CapsuleResult<()>;

    async fn resume(&self, vm: &str) -> CapsuleResult<()>;

    async fn resize(&self, vm: &str, request: ResizeRequest) -> CapsuleResult<()>;

    /// Write the VM's state to `destination` (absolute path).
    async fn snapshot(&self, vm: &str, destination: &Path) -> CapsuleResult<()>;

    /// Load VM state from `source` (absolute path).
    async fn restore(&self, vm: &str, source: &Path) -> CapsuleResult<()>;

    async fn info(&self, vm: &str) -> CapsuleResult<Value>;

    async fn counters(&self, vm: &str) -> CapsuleResult<Value>;

    /// Terminate the hypervisor process and drop the session.
    /// Stopping a VM with no session succeeds.
    async fn stop(&self, vm: &str) -> CapsuleResult<()>;
}
