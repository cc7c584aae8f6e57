//! Subprocess spawning for the hypervisor binary.

use std::path::Path;
use std::process::Stdio;

use capsule_shared::{CapsuleError, CapsuleResult};
use tokio::process::{Child, Command};

use crate::vmm::VmmConfig;

/// Command-line arguments for a hypervisor listening on `config.api_socket`.
///
/// Only the control socket and boot-time sizing go on the command line; the
/// full device model is sent later through `vm.create`.
pub(crate) fn hypervisor_args(config: &VmmConfig) -> Vec<String> {
    vec![
        "--api-socket".to_string(),
        format!("path={}", config.api_socket.display()),
        "--cpus".to_string(),
        format!("boot={}", config.vcpus),
        "--memory".to_string(),
        format!("size={}M", config.memory_mib),
    ]
}

/// Spawn the hypervisor with null stdio.
///
/// The child is killed if its handle is dropped without an explicit stop.
pub(crate) fn spawn_hypervisor(binary: &Path, config: &VmmConfig) -> CapsuleResult<Child> {
    let mut cmd = Command::new(binary);
    cmd.args(hypervisor_args(config));

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        cmd.env("RUST_LOG", rust_log);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        let err_msg = format!(
            "Failed to spawn hypervisor {} for VM {}: {}",
            binary.display(),
            config.vm_name,
            e
        );
        tracing::error!("{}", err_msg);
        CapsuleError::Transport(err_msg)
    })
}
