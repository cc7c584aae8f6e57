//! Process supervision helpers for hypervisor subprocesses.

use std::process::ExitStatus;
use std::time::Duration;

use capsule_shared::{CapsuleError, CapsuleResult};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;

/// Stop a child process in two phases.
///
/// 1. SIGTERM, then wait up to `grace` for a clean exit
/// 2. SIGKILL, then reap
///
/// Returns the exit status, or `None` if the process had already been reaped.
pub async fn terminate_gracefully(
    child: &mut Child,
    grace: Duration,
) -> CapsuleResult<Option<ExitStatus>> {
    let Some(pid) = child.id() else {
        // Already reaped by an earlier wait.
        return Ok(None);
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "SIGTERM failed, process likely exited");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            tracing::debug!(pid, ?status, "Process exited after SIGTERM");
            Ok(Some(status))
        }
        Err(_) => {
            tracing::warn!(
                pid,
                grace_secs = grace.as_secs(),
                "Process ignored SIGTERM, sending SIGKILL"
            );
            child.kill().await.map_err(|e| {
                CapsuleError::Internal(format!("Failed to kill process {}: {}", pid, e))
            })?;
            Ok(child.try_wait()?)
        }
    }
}
