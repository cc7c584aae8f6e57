use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult};
use serde_json::Value;

use super::session::HypervisorSession;
use super::{ControllerSettings, VmmController};
use crate::vmm::api::ops;
use crate::vmm::descriptor::{RestoreRequest, SnapshotRequest, file_url};
use crate::vmm::{ResizeRequest, VmDescriptor, VmmConfig};

type SharedSession = Arc<tokio::sync::Mutex<HypervisorSession>>;

/// Drives one `cloud-hypervisor` subprocess per VM.
pub struct CloudHypervisorController {
    settings: ControllerSettings,
    sessions: parking_lot::Mutex<HashMap<String, SharedSession>>,
}

impl CloudHypervisorController {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings,
            sessions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, vm: &str) -> CapsuleResult<SharedSession> {
        self.sessions.lock().get(vm).cloned().ok_or_else(|| {
            CapsuleError::InvalidState(format!("no hypervisor session for VM {}", vm))
        })
    }

    async fn put(&self, vm: &str, op: &str, body: Option<Value>) -> CapsuleResult<Option<Value>> {
        let session = self.session(vm)?;
        let session = session.lock().await;
        tracing::debug!(vm, op, "Hypervisor request");
        session.client().put(op, body.as_ref()).await
    }

    async fn get(&self, vm: &str, op: &str) -> CapsuleResult<Value> {
        let session = self.session(vm)?;
        let session = session.lock().await;
        Ok(session.client().get(op).await?.unwrap_or(Value::Null))
    }
}

impl std::fmt::Debug for CloudHypervisorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudHypervisorController")
            .field("binary", &self.settings.binary)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl VmmController for CloudHypervisorController {
    async fn start(&self, config: &VmmConfig) -> CapsuleResult<()> {
        let existing = self.sessions.lock().get(&config.vm_name).cloned();
        if let Some(existing) = existing {
            let mut session = existing.lock().await;
            if session.is_alive() {
                tracing::debug!(vm = %config.vm_name, "Hypervisor already running");
                return Ok(());
            }
            // Stale session from a process that died on its own.
            session.close(&self.settings).await?;
            self.sessions.lock().remove(&config.vm_name);
        }

        let session = HypervisorSession::spawn(&self.settings, config).await?;
        self.sessions.lock().insert(
            config.vm_name.clone(),
            Arc::new(tokio::sync::Mutex::new(session)),
        );
        Ok(())
    }

    async fn create(&self, config: &VmmConfig) -> CapsuleResult<()> {
        let descriptor = serde_json::to_value(VmDescriptor::build(config)?)?;
        self.put(&config.vm_name, ops::VM_CREATE, Some(descriptor))
            .await
            .map(|_| ())
    }

    async fn boot(&self, vm: &str) -> CapsuleResult<()> {
        self.put(vm, ops::VM_BOOT, None).await.map(|_| ())
    }

    async fn shutdown(&self, vm: &str) -> CapsuleResult<()> {
        self.put(vm, ops::VM_SHUTDOWN, None).await.map(|_| ())
    }

    async fn pause(&self, vm: &str) -> CapsuleResult<()> {
        self.put(vm, ops::VM_PAUSE, None).await.map(|_| ())
    }

    async fn resume(&self, vm: &str) -> CapsuleResult<()> {
        self.put(vm, ops::VM_RESUME, None).await.map(|_| ())
    }

    async fn resize(&self, vm: &str, request: ResizeRequest) -> CapsuleResult<()> {
        let body = serde_json::to_value(request)?;
        self.put(vm, ops::VM_RESIZE, Some(body)).await.map(|_| ())
    }

    /// Capture `vm` to `destination`.
    ///
    /// The hypervisor only snapshots paused guests, so a running guest is
    /// paused for the capture and resumed afterwards even if the capture
    /// failed.
    async fn snapshot(&self, vm: &str, destination: &Path) -> CapsuleResult<()> {
        let body = serde_json::to_value(SnapshotRequest {
            destination_url: file_url(destination)?,
        })?;
        let session = self.session(vm)?;
        let session = session.lock().await;
        let client = session.client();

        let info = client.get(ops::VM_INFO).await?.unwrap_or(Value::Null);
        let was_running = match info.get("state").and_then(Value::as_str) {
            Some("Running") => true,
            Some("Paused") => false,
            other => {
                return Err(CapsuleError::InvalidState(format!(
                    "VM {} cannot be snapshotted in hypervisor state {:?}",
                    vm, other
                )));
            }
        };

        if was_running {
            client.put(ops::VM_PAUSE, None).await?;
        }
        let captured = client.put(ops::VM_SNAPSHOT, Some(&body)).await.map(|_| ());
        if was_running && let Err(e) = client.put(ops::VM_RESUME, None).await {
            tracing::warn!(vm, error = %e, "Resume after snapshot failed");
            captured?;
            return Err(e);
        }
        captured
    }

    async fn restore(&self, vm: &str, source: &Path) -> CapsuleResult<()> {
        let body = serde_json::to_value(RestoreRequest {
            source_url: file_url(source)?,
        })?;
        self.put(vm, ops::VM_RESTORE, Some(body)).await.map(|_| ())
    }

    async fn info(&self, vm: &str) -> CapsuleResult<Value> {
        self.get(vm, ops::VM_INFO).await
    }

    async fn counters(&self, vm: &str) -> CapsuleResult<Value> {
        self.get(vm, ops::VM_COUNTERS).await
    }

    async fn stop(&self, vm: &str) -> CapsuleResult<()> {
        let session = self.sessions.lock().remove(vm);
        let Some(session) = session else {
            tracing::debug!(vm, "No hypervisor session to stop");
            return Ok(());
        };
        let mut session = session.lock().await;
        session.close(&self.settings).await
    }
}

#[cfg(test)]
impl CloudHypervisorController {
    async fn has_live_session(&self, vm: &str) -> bool {
        let session = self.sessions.lock().get(vm).cloned();
        match session {
            Some(session) => session.lock().await.is_alive(),
            None => false,
        }
    }
}
