//! Runtime facade tying the lifecycle, snapshot, and guest layers together.

use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult, Transport};
use futures::future::join_all;

use crate::db::VmStore;
use crate::init_logging_for;
use crate::portal::GuestSession;
use crate::runtime::constants::guest;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::{RuntimeLock, VmLocks};
use crate::runtime::options::CapsuleOptions;
use crate::runtime::types::OsKind;
use crate::snapshot::{
    CleanupReport, CreateSnapshotRequest, IntegrityReport, SnapshotManager, SnapshotMetadata,
    SnapshotStatistics,
};
use crate::vm::{
    CreateVmRequest, LifecycleManager, TemplateStore, VmManager, VmRecord, VmState, VmStatus,
};
use crate::vmm::controller::{CloudHypervisorController, ControllerSettings, VmmController};

/// Entry point for creating and operating sandbox VMs.
///
/// **Prepare Before Execute**: the home directory, logging, and registry are
/// ready before `new` returns, and persisted records left behind by a previous
/// process have been reconciled.
///
/// **Cloning**: cheap, all clones share the same state.
#[derive(Clone)]
pub struct CapsuleRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    options: CapsuleOptions,
    layout: FilesystemLayout,
    lifecycle: LifecycleManager,
    snapshots: SnapshotManager,
    _runtime_lock: RuntimeLock,
}

impl std::fmt::Debug for CapsuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleRuntime")
            .field("home", &self.inner.layout.home_dir())
            .finish()
    }
}

impl CapsuleRuntime {
    /// Create a runtime driving cloud-hypervisor subprocesses.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unusable options or a home directory already
    /// owned by another runtime, and `Storage` if the home directory or
    /// registry cannot be initialized.
    pub fn new(options: CapsuleOptions) -> CapsuleResult<Self> {
        let controller = Arc::new(CloudHypervisorController::new(
            ControllerSettings::from_options(&options),
        ));
        Self::with_controller(options, controller)
    }

    /// Create a runtime over the default home directory and its `config.toml`.
    pub fn from_default_home() -> CapsuleResult<Self> {
        Self::new(CapsuleOptions::load(None)?)
    }

    /// Create a runtime with a caller-supplied hypervisor controller.
    pub fn with_controller(
        options: CapsuleOptions,
        controller: Arc<dyn VmmController>,
    ) -> CapsuleResult<Self> {
        options.sanitize()?;

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            CapsuleError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let runtime_lock = RuntimeLock::acquire(layout.home_dir())?;

        let registry = VmManager::open(VmStore::open(&layout.vms_dir())?)?;

        let locks = VmLocks::new();
        let lifecycle = LifecycleManager::new(
            registry,
            controller.clone(),
            TemplateStore::new(layout.templates_dir()),
            layout.clone(),
            locks.clone(),
        );
        let snapshots = SnapshotManager::new(layout.snapshots_dir(), controller, locks)
            .with_limits(options.max_snapshots_per_vm, options.snapshot_retention_days);

        let recovered = lifecycle.recover()?;
        tracing::info!(
            home = %layout.home_dir().display(),
            recovered,
            "Initialized capsule runtime"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                options,
                layout,
                lifecycle,
                snapshots,
                _runtime_lock: runtime_lock,
            }),
        })
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }

    pub fn options(&self) -> &CapsuleOptions {
        &self.inner.options
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub async fn create_vm(&self, request: CreateVmRequest) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.create(request).await
    }

    pub async fn start_vm(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.start(name).await
    }

    pub async fn stop_vm(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.stop(name).await
    }

    pub async fn pause_vm(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.pause(name).await
    }

    pub async fn resume_vm(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.resume(name).await
    }

    pub async fn delete_vm(&self, name: &str) -> CapsuleResult<()> {
        self.inner.lifecycle.delete(name).await
    }

    pub async fn resize_vm(
        &self,
        name: &str,
        vcpus: Option<u32>,
        memory_mib: Option<u64>,
    ) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.resize(name, vcpus, memory_mib).await
    }

    pub async fn get_vm_status(&self, name: &str) -> CapsuleResult<VmStatus> {
        self.inner.lifecycle.get_status(name).await
    }

    pub fn list_vms(&self) -> Vec<VmRecord> {
        self.inner.lifecycle.list()
    }

    /// Stop every running or paused VM concurrently.
    ///
    /// Returns the names that failed to stop; those are left in `Error`.
    pub async fn shutdown(&self) -> Vec<String> {
        let active: Vec<String> = self
            .list_vms()
            .into_iter()
            .filter(|r| r.state.is_active())
            .map(|r| r.name)
            .collect();
        if active.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = active.len(), "Stopping active VMs");
        let results = join_all(active.iter().map(|name| self.stop_vm(name))).await;

        active
            .into_iter()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(_) => None,
                Err(e) => {
                    tracing::error!(vm = %name, error = %e, "Failed to stop VM during shutdown");
                    Some(name)
                }
            })
            .collect()
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    fn require_vm(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.inner.lifecycle.get(name)
    }

    pub async fn create_snapshot(
        &self,
        vm: &str,
        request: CreateSnapshotRequest,
    ) -> CapsuleResult<SnapshotMetadata> {
        self.require_vm(vm)?;
        self.inner.snapshots.create_snapshot(vm, request).await
    }

    pub async fn list_snapshots(&self, vm: &str) -> CapsuleResult<Vec<SnapshotMetadata>> {
        self.inner.snapshots.list_snapshots(vm).await
    }

    pub async fn restore_snapshot(&self, vm: &str, name: &str) -> CapsuleResult<SnapshotMetadata> {
        self.inner
            .lifecycle
            .restore_snapshot(vm, &self.inner.snapshots, name)
            .await
    }

    pub async fn delete_snapshot(&self, vm: &str, name: &str) -> CapsuleResult<()> {
        self.inner.snapshots.delete_snapshot(vm, name).await
    }

    pub async fn verify_snapshot(&self, vm: &str, name: &str) -> CapsuleResult<IntegrityReport> {
        self.inner.snapshots.verify_snapshot_integrity(vm, name).await
    }

    pub async fn cleanup_snapshots(&self, days_old: Option<u32>) -> CapsuleResult<CleanupReport> {
        self.inner.snapshots.cleanup_old_snapshots(days_old).await
    }

    pub async fn snapshot_statistics(&self) -> CapsuleResult<SnapshotStatistics> {
        self.inner.snapshots.get_snapshot_statistics().await
    }

    // ========================================================================
    // GUEST
    // ========================================================================

    /// Open a guest agent session for a running VM.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown VMs and `InvalidState` if the VM has no
    /// guest agent or is not running.
    pub fn guest(&self, vm: &str) -> CapsuleResult<GuestSession> {
        let record = self.require_vm(vm)?;
        if !record.guest_agent {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} was created without a guest agent",
                vm
            )));
        }
        if record.state != VmState::Running {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, guest agent requires RUNNING",
                vm, record.state
            )));
        }

        let transport = match record.os {
            OsKind::Linux => Transport::hybrid_vsock(
                self.inner.layout.guest_socket_path(vm),
                self.inner.options.guest_agent_port,
            ),
            OsKind::Windows => Transport::named_pipe(format!("{}{}", guest::PIPE_PREFIX, vm)),
        };

        Ok(GuestSession::new(vm, transport, record.os).with_timeouts(
            self.inner.options.guest_connect_timeout(),
            self.inner.options.guest_command_timeout(),
        ))
    }
}
