//! One live hypervisor process and its control socket.

use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};
use tokio::process::Child;

use super::ControllerSettings;
use super::spawn::spawn_hypervisor;
use crate::util::terminate_gracefully;
use crate::vmm::VmmConfig;
use crate::vmm::api::ApiClient;

pub(crate) struct HypervisorSession {
    vm_name: String,
    api_socket: PathBuf,
    child: Child,
    client: ApiClient,
}

impl HypervisorSession {
    /// Spawn the hypervisor and wait until its control socket answers a ping.
    ///
    /// Polls at most `settings.ready_attempts` times. If the process exits
    /// early or the socket never becomes ready, the process is torn down and
    /// a `Transport` error is returned.
    pub async fn spawn(settings: &ControllerSettings, config: &VmmConfig) -> CapsuleResult<Self> {
        remove_socket(&config.api_socket);

        let child = spawn_hypervisor(&settings.binary, config)?;
        let mut session = Self {
            vm_name: config.vm_name.clone(),
            api_socket: config.api_socket.clone(),
            child,
            client: ApiClient::new(&config.api_socket),
        };

        tracing::info!(
            vm = %session.vm_name,
            pid = ?session.child.id(),
            socket = %session.api_socket.display(),
            "Spawned hypervisor"
        );

        if let Err(e) = session.wait_until_ready(settings).await {
            tracing::warn!(vm = %session.vm_name, error = %e, "Hypervisor never became ready");
            if let Err(stop_err) = session.close(settings).await {
                tracing::warn!(vm = %session.vm_name, error = %stop_err, "Cleanup after failed start");
            }
            return Err(e);
        }

        Ok(session)
    }

    pub(super) async fn wait_until_ready(&mut self, settings: &ControllerSettings) -> CapsuleResult<()> {
        let mut last_error = String::from("socket not created");
        // A socket that accepts but never answers must not stall a single attempt.
        let ping_client = ApiClient::new(&self.api_socket).with_timeout(settings.ready_interval);

        for attempt in 1..=settings.ready_attempts {
            if let Some(status) = self.child.try_wait()? {
                return Err(CapsuleError::Transport(format!(
                    "hypervisor for VM {} exited with {} before its control socket was ready",
                    self.vm_name, status
                )));
            }

            if self.api_socket.exists() {
                match ping_client.ping().await {
                    Ok(()) => {
                        tracing::debug!(vm = %self.vm_name, attempt, "Control socket ready");
                        return Ok(());
                    }
                    Err(e) => last_error = e.to_string(),
                }
            }

            tokio::time::sleep(settings.ready_interval).await;
        }

        Err(CapsuleError::Transport(format!(
            "control socket {} not ready after {} attempts: {}",
            self.api_socket.display(),
            settings.ready_attempts,
            last_error
        )))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the process (SIGTERM, then SIGKILL after the grace period) and
    /// remove the control socket.
    pub async fn close(&mut self, settings: &ControllerSettings) -> CapsuleResult<()> {
        let status = terminate_gracefully(&mut self.child, settings.stop_grace).await?;
        tracing::info!(vm = %self.vm_name, ?status, "Hypervisor stopped");
        remove_socket(&self.api_socket);
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(socket = %path.display(), error = %e, "Failed to remove control socket"),
    }
}

#[cfg(test)]
impl HypervisorSession {
    /// Wrap an already running process whose control socket is `api_socket`.
    pub fn attach_for_test(vm_name: &str, api_socket: &Path, child: Child) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            api_socket: api_socket.to_path_buf(),
            child,
            client: ApiClient::new(api_socket),
        }
    }
}
