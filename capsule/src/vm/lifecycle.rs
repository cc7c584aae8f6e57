//! VM lifecycle state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use super::manager::VmManager;
use super::state::{VmRecord, VmState};
use super::template::{TemplateStore, validate_resources};
use crate::runtime::{FilesystemLayout, VmLocks, validate_name};
use crate::snapshot::{SnapshotManager, SnapshotMetadata};
use crate::vmm::controller::VmmController;
use crate::vmm::{ResizeRequest, VmDescriptor, VmmConfig};

/// Arguments for [`LifecycleManager::create`].
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub name: String,
    pub template: String,
    /// Overrides the template's vCPU count.
    pub vcpus: Option<u32>,
    /// Overrides the template's memory size.
    pub memory_mib: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

impl CreateVmRequest {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            vcpus: None,
            memory_mib: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_resources(mut self, vcpus: u32, memory_mib: u64) -> Self {
        self.vcpus = Some(vcpus);
        self.memory_mib = Some(memory_mib);
        self
    }
}

/// Persisted record plus, for running VMs, live hypervisor introspection.
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    #[serde(flatten)]
    pub record: VmRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counters: Option<Value>,
}

/// Drives VMs through their states and keeps the registry in step.
///
/// Every mutating operation holds the VM's lock from validation to the final
/// registry write. Communication failures during `create`, `start` and `stop`
/// leave the VM in `Error` with its hypervisor torn down; `pause`, `resume`
/// and `resize` failures leave the state unchanged.
pub struct LifecycleManager {
    registry: VmManager,
    controller: Arc<dyn VmmController>,
    templates: TemplateStore,
    layout: FilesystemLayout,
    locks: VmLocks,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("home", &self.layout.home_dir())
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(
        registry: VmManager,
        controller: Arc<dyn VmmController>,
        templates: TemplateStore,
        layout: FilesystemLayout,
        locks: VmLocks,
    ) -> Self {
        Self {
            registry,
            controller,
            templates,
            layout,
            locks,
        }
    }

    fn record(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.registry
            .get(name)
            .ok_or_else(|| CapsuleError::NotFound(format!("VM {}", name)))
    }

    fn vmm_config(&self, record: &VmRecord) -> CapsuleResult<VmmConfig> {
        let template = self.templates.resolve(&record.template)?;
        Ok(template.to_vmm_config(&record.name, record.vcpus, record.memory_mib, &self.layout))
    }

    /// Stop the hypervisor, logging instead of failing.
    async fn teardown(&self, name: &str) {
        if let Err(e) = self.controller.stop(name).await {
            tracing::warn!(vm = name, error = %e, "Hypervisor teardown failed");
        }
    }

    /// Register a new VM and have the hypervisor validate its configuration.
    ///
    /// The hypervisor is started, sent the descriptor, then torn down again;
    /// the VM ends `Stopped`. On failure it ends `Error` and the error is
    /// returned.
    pub async fn create(&self, request: CreateVmRequest) -> CapsuleResult<VmRecord> {
        validate_name("VM", &request.name)?;
        let template = self.templates.resolve(&request.template)?;
        let vcpus = request.vcpus.unwrap_or(template.vcpus);
        let memory_mib = request.memory_mib.unwrap_or(template.memory_mib);
        validate_resources(vcpus, memory_mib)?;

        let config = template.to_vmm_config(&request.name, vcpus, memory_mib, &self.layout);
        VmDescriptor::build(&config)?;
        self.layout.check_socket_paths(&request.name)?;

        let _guard = self.locks.lock(&request.name).await;

        if self.registry.contains(&request.name) {
            return Err(CapsuleError::AlreadyExists(format!(
                "VM {} already exists",
                request.name
            )));
        }

        let now = Utc::now();
        let record = VmRecord {
            name: request.name.clone(),
            state: VmState::Creating,
            vcpus,
            memory_mib,
            os: template.os,
            template: request.template.clone(),
            guest_agent: template.guest_agent,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        self.registry.register(record)?;
        tracing::info!(vm = %request.name, template = %request.template, vcpus, memory_mib, "Creating VM");

        let result = async {
            self.controller.start(&config).await?;
            self.controller.create(&config).await
        }
        .await;
        self.teardown(&request.name).await;

        match result {
            Ok(()) => {
                let record = self.registry.update_state(&request.name, VmState::Stopped)?;
                tracing::info!(vm = %request.name, "VM created");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(vm = %request.name, error = %e, "VM creation failed");
                self.registry.update_state(&request.name, VmState::Error)?;
                Err(e)
            }
        }
    }

    /// Boot a stopped VM.
    pub async fn start(&self, name: &str) -> CapsuleResult<VmRecord> {
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if !record.state.can_start() {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, can only start from STOPPED",
                name, record.state
            )));
        }
        let config = self.vmm_config(&record)?;

        tracing::info!(vm = name, "Starting VM");
        let result = async {
            self.controller.start(&config).await?;
            self.controller.create(&config).await?;
            self.controller.boot(name).await
        }
        .await;

        match result {
            Ok(()) => {
                let record = self.registry.update_state(name, VmState::Running)?;
                tracing::info!(vm = name, "VM running");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(vm = name, error = %e, "VM start failed");
                self.teardown(name).await;
                self.registry.update_state(name, VmState::Error)?;
                Err(e)
            }
        }
    }

    /// Shut down a running or paused VM and release its hypervisor.
    pub async fn stop(&self, name: &str) -> CapsuleResult<VmRecord> {
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if !record.state.can_stop() {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, can only stop from RUNNING or PAUSED",
                name, record.state
            )));
        }

        tracing::info!(vm = name, "Stopping VM");
        let shutdown = self.controller.shutdown(name).await;
        if let Err(e) = &shutdown {
            tracing::warn!(vm = name, error = %e, "Guest shutdown request failed, tearing down");
        }
        let release = self.controller.stop(name).await;

        match shutdown.and(release) {
            Ok(()) => {
                let record = self.registry.update_state(name, VmState::Stopped)?;
                tracing::info!(vm = name, "VM stopped");
                Ok(record)
            }
            Err(e) => {
                self.registry.update_state(name, VmState::Error)?;
                Err(e)
            }
        }
    }

    pub async fn pause(&self, name: &str) -> CapsuleResult<VmRecord> {
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if !record.state.can_pause() {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, can only pause from RUNNING",
                name, record.state
            )));
        }

        self.controller.pause(name).await?;
        tracing::info!(vm = name, "VM paused");
        self.registry.update_state(name, VmState::Paused)
    }

    pub async fn resume(&self, name: &str) -> CapsuleResult<VmRecord> {
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if !record.state.can_resume() {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, can only resume from PAUSED",
                name, record.state
            )));
        }

        self.controller.resume(name).await?;
        tracing::info!(vm = name, "VM resumed");
        self.registry.update_state(name, VmState::Running)
    }

    /// Remove a VM in any state, stopping it first if needed.
    ///
    /// If the hypervisor cannot be released the record is kept in `Error`.
    /// Snapshots of the VM are left in place.
    pub async fn delete(&self, name: &str) -> CapsuleResult<()> {
        let guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        tracing::info!(vm = name, state = %record.state, "Deleting VM");

        if record.state.is_active()
            && let Err(e) = self.controller.shutdown(name).await
        {
            tracing::warn!(vm = name, error = %e, "Guest shutdown failed during delete");
        }

        if let Err(e) = self.controller.stop(name).await {
            tracing::error!(vm = name, error = %e, "Failed to release hypervisor, keeping record");
            self.registry.update_state(name, VmState::Error)?;
            return Err(e);
        }

        remove_stale_file(&self.layout.guest_socket_path(name));
        self.registry.remove(name)?;

        drop(guard);
        self.locks.prune();
        tracing::info!(vm = name, "VM deleted");
        Ok(())
    }

    /// Replace a VM's state with one of its snapshots and leave it running.
    ///
    /// The hypervisor only restores into a process that has not been sent a
    /// descriptor, so any existing process is released and a fresh one is
    /// started without `vm.create`. A missing snapshot fails before the VM is
    /// touched. A hypervisor failure tears the process down and leaves the
    /// VM in `Error`.
    pub async fn restore_snapshot(
        &self,
        name: &str,
        snapshots: &SnapshotManager,
        snapshot: &str,
    ) -> CapsuleResult<SnapshotMetadata> {
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if !record.state.can_restore() {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, cannot restore while CREATING",
                name, record.state
            )));
        }
        let config = self.vmm_config(&record)?;
        let (metadata, blob) = snapshots.restore_source_locked(name, snapshot).await?;

        tracing::info!(vm = name, snapshot, from = %record.state, "Restoring snapshot");
        let result = async {
            self.controller.stop(name).await?;
            self.controller.start(&config).await?;
            self.controller.restore(name, &blob).await?;
            self.controller.resume(name).await
        }
        .await;

        match result {
            Ok(()) => {
                self.registry.update_state(name, VmState::Running)?;
                tracing::info!(vm = name, snapshot, "Snapshot restored");
                Ok(metadata)
            }
            Err(e) => {
                tracing::error!(vm = name, snapshot, error = %e, "Snapshot restore failed");
                self.teardown(name).await;
                self.registry.update_state(name, VmState::Error)?;
                Err(e)
            }
        }
    }

    /// Persisted record, merged with live `info` and `counters` when running.
    ///
    /// Introspection failures are logged and leave the live fields empty.
    pub async fn get_status(&self, name: &str) -> CapsuleResult<VmStatus> {
        let record = self.record(name)?;
        let mut status = VmStatus {
            record,
            info: None,
            counters: None,
        };

        if status.record.state == VmState::Running {
            match self.controller.info(name).await {
                Ok(info) => status.info = Some(info),
                Err(e) => tracing::warn!(vm = name, error = %e, "vm.info failed"),
            }
            match self.controller.counters(name).await {
                Ok(counters) => status.counters = Some(counters),
                Err(e) => tracing::warn!(vm = name, error = %e, "vm.counters failed"),
            }
        }

        Ok(status)
    }

    pub fn get(&self, name: &str) -> CapsuleResult<VmRecord> {
        self.record(name)
    }

    /// All VMs, newest first.
    pub fn list(&self) -> Vec<VmRecord> {
        self.registry.list()
    }

    /// Hot-resize a running VM and persist the new sizes.
    pub async fn resize(
        &self,
        name: &str,
        vcpus: Option<u32>,
        memory_mib: Option<u64>,
    ) -> CapsuleResult<VmRecord> {
        let request = ResizeRequest::new(vcpus, memory_mib)?;
        let _guard = self.locks.lock(name).await;

        let record = self.record(name)?;
        if record.state != VmState::Running {
            return Err(CapsuleError::InvalidState(format!(
                "VM {} is {}, can only resize while RUNNING",
                name, record.state
            )));
        }
        validate_resources(
            vcpus.unwrap_or(record.vcpus),
            memory_mib.unwrap_or(record.memory_mib),
        )?;

        self.controller.resize(name, request).await?;
        tracing::info!(vm = name, ?vcpus, ?memory_mib, "VM resized");

        self.registry.update(name, |r| {
            if let Some(v) = vcpus {
                r.vcpus = v;
            }
            if let Some(m) = memory_mib {
                r.memory_mib = m;
            }
            r.updated_at = Utc::now();
        })
    }

    /// Reconcile persisted state after a control plane restart.
    ///
    /// No hypervisor session survives the process that owned it, so
    /// `Running`/`Paused` records become `Stopped` and `Creating` records
    /// become `Error`. Returns the number of records changed.
    pub fn recover(&self) -> CapsuleResult<usize> {
        let mut changed = 0;
        for record in self.registry.list() {
            let target = match record.state {
                VmState::Running | VmState::Paused => VmState::Stopped,
                VmState::Creating => VmState::Error,
                VmState::Stopped | VmState::Error => continue,
            };
            tracing::warn!(vm = %record.name, from = %record.state, to = %target, "Recovering VM state");
            self.registry.update_state(&record.name, target)?;
            remove_stale_file(&self.layout.api_socket_path(&record.name));
            remove_stale_file(&self.layout.guest_socket_path(&record.name));
            changed += 1;
        }
        Ok(changed)
    }
}

fn remove_stale_file(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale socket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::VmStore;
    use crate::snapshot::CreateSnapshotRequest;
    use std::path::PathBuf;
    use crate::vm::template::{LINUX_DEFAULT, WINDOWS_DEFAULT};
    use crate::vmm::controller::fake::FakeController;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        layout: FilesystemLayout,
        controller: Arc<FakeController>,
        manager: LifecycleManager,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let controller = FakeController::new();
        let manager = build_manager(&layout, controller.clone());
        Harness {
            _dir: dir,
            layout,
            controller,
            manager,
        }
    }

    fn build_manager(layout: &FilesystemLayout, controller: Arc<FakeController>) -> LifecycleManager {
        build_with_locks(layout, controller, VmLocks::new())
    }

    fn build_with_locks(
        layout: &FilesystemLayout,
        controller: Arc<FakeController>,
        locks: VmLocks,
    ) -> LifecycleManager {
        let registry = VmManager::open(VmStore::open(&layout.vms_dir()).unwrap()).unwrap();
        LifecycleManager::new(
            registry,
            controller,
            TemplateStore::new(layout.templates_dir()),
            layout.clone(),
            locks,
        )
    }

    async fn create_running(h: &Harness, name: &str) {
        h.manager
            .create(CreateVmRequest::new(name, LINUX_DEFAULT))
            .await
            .unwrap();
        h.manager.start(name).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_ends_stopped_without_session() {
        let h = harness();
        let record = h
            .manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT).with_resources(2, 512))
            .await
            .unwrap();

        assert_eq!(record.state, VmState::Stopped);
        assert_eq!(record.vcpus, 2);
        assert!(record.guest_agent);
        assert!(!h.controller.has_session("vm1"));
        assert_eq!(
            h.controller.calls(),
            vec!["start:vm1", "create:vm1", "stop:vm1"]
        );
    }

    #[tokio::test]
    async fn test_create_uses_template_defaults() {
        let h = harness();
        let record = h
            .manager
            .create(CreateVmRequest::new("win", WINDOWS_DEFAULT))
            .await
            .unwrap();
        assert_eq!(record.memory_mib, 4096);
        assert_eq!(record.os, crate::runtime::OsKind::Windows);
    }

    #[tokio::test]
    async fn test_create_failure_ends_in_error() {
        let h = harness();
        h.controller.fail_on("create");

        let err = h
            .manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Protocol(_)));

        let record = h.manager.get("vm1").unwrap();
        assert_eq!(record.state, VmState::Error);
        assert!(!h.controller.has_session("vm1"));
    }

    #[tokio::test]
    async fn test_create_validation_has_no_side_effects() {
        let h = harness();
        let cases = [
            CreateVmRequest::new("bad name", LINUX_DEFAULT),
            CreateVmRequest::new("vm1", "no-such-template"),
            CreateVmRequest::new("vm1", LINUX_DEFAULT).with_resources(0, 512),
            CreateVmRequest::new("vm1", LINUX_DEFAULT).with_resources(2, 64),
            CreateVmRequest::new("vm1", LINUX_DEFAULT).with_resources(2, u64::MAX / 1024),
        ];
        for request in cases {
            let err = h.manager.create(request).await.unwrap_err();
            assert!(matches!(err, CapsuleError::Validation(_)), "{err:?}");
        }
        assert!(h.manager.list().is_empty());
        assert!(h.controller.calls().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let h = harness();
        h.manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap();
        let err = h
            .manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let h = harness();
        h.manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT).with_resources(2, 512))
            .await
            .unwrap();

        assert_eq!(h.manager.start("vm1").await.unwrap().state, VmState::Running);
        assert!(h.controller.vm("vm1").unwrap().booted);

        assert_eq!(h.manager.pause("vm1").await.unwrap().state, VmState::Paused);
        assert_eq!(h.manager.resume("vm1").await.unwrap().state, VmState::Running);
        assert_eq!(h.manager.stop("vm1").await.unwrap().state, VmState::Stopped);
        assert!(!h.controller.has_session("vm1"));

        h.manager.delete("vm1").await.unwrap();
        assert!(matches!(
            h.manager.get("vm1").unwrap_err(),
            CapsuleError::NotFound(_)
        ));
        assert!(!h.layout.vms_dir().join("vm1.json").exists());
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected_without_change() {
        let h = harness();
        h.manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap();
        let calls_before = h.controller.calls().len();

        for err in [
            h.manager.pause("vm1").await.unwrap_err(),
            h.manager.resume("vm1").await.unwrap_err(),
            h.manager.stop("vm1").await.unwrap_err(),
            h.manager.resize("vm1", Some(4), None).await.unwrap_err(),
        ] {
            assert!(matches!(err, CapsuleError::InvalidState(_)), "{err:?}");
        }
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Stopped);

        h.manager.start("vm1").await.unwrap();
        assert!(matches!(
            h.manager.start("vm1").await.unwrap_err(),
            CapsuleError::InvalidState(_)
        ));
        assert!(matches!(
            h.manager.resume("vm1").await.unwrap_err(),
            CapsuleError::InvalidState(_)
        ));
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Running);
        assert!(h.controller.calls().len() > calls_before);
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.manager.start("ghost").await.unwrap_err(),
            CapsuleError::NotFound(_)
        ));
        assert!(matches!(
            h.manager.get_status("ghost").await.unwrap_err(),
            CapsuleError::NotFound(_)
        ));
        assert!(matches!(
            h.manager.delete("ghost").await.unwrap_err(),
            CapsuleError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_start_failure_ends_in_error_and_tears_down() {
        let h = harness();
        h.manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap();
        h.controller.fail_on("boot");

        assert!(h.manager.start("vm1").await.is_err());
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Error);
        assert!(!h.controller.has_session("vm1"));

        // Error is terminal for start.
        h.controller.clear_failures();
        assert!(matches!(
            h.manager.start("vm1").await.unwrap_err(),
            CapsuleError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_failure_still_tears_down() {
        let h = harness();
        create_running(&h, "vm1").await;
        h.controller.fail_on("shutdown");

        assert!(h.manager.stop("vm1").await.is_err());
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Error);
        assert!(!h.controller.has_session("vm1"));
    }

    #[tokio::test]
    async fn test_pause_failure_leaves_state() {
        let h = harness();
        create_running(&h, "vm1").await;
        h.controller.fail_on("pause");

        assert!(h.manager.pause("vm1").await.is_err());
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_delete_running_vm_stops_it() {
        let h = harness();
        create_running(&h, "vm1").await;

        h.manager.delete("vm1").await.unwrap();
        assert!(!h.controller.has_session("vm1"));
        assert!(h.manager.list().is_empty());
        let calls = h.controller.calls();
        assert!(calls.contains(&"shutdown:vm1".to_string()));
    }

    #[tokio::test]
    async fn test_delete_keeps_record_when_release_fails() {
        let h = harness();
        create_running(&h, "vm1").await;
        h.controller.fail_on("stop");

        assert!(h.manager.delete("vm1").await.is_err());
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Error);

        // Retrying once the hypervisor cooperates removes it.
        h.controller.clear_failures();
        h.manager.delete("vm1").await.unwrap();
        assert!(h.manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_get_status_merges_live_info() {
        let h = harness();
        h.manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap();

        let status = h.manager.get_status("vm1").await.unwrap();
        assert!(status.info.is_none());

        h.manager.start("vm1").await.unwrap();
        let status = h.manager.get_status("vm1").await.unwrap();
        assert_eq!(status.info.unwrap()["state"], "Running");
        assert!(status.counters.is_some());

        h.controller.fail_on("info");
        let status = h.manager.get_status("vm1").await.unwrap();
        assert!(status.info.is_none());
        assert!(status.counters.is_some());
    }

    #[tokio::test]
    async fn test_resize() {
        let h = harness();
        create_running(&h, "vm1").await;

        let record = h.manager.resize("vm1", Some(4), Some(1024)).await.unwrap();
        assert_eq!(record.vcpus, 4);
        assert_eq!(record.memory_mib, 1024);
        assert_eq!(h.controller.vm("vm1").unwrap().memory_mib, 1024);

        assert!(matches!(
            h.manager.resize("vm1", None, None).await.unwrap_err(),
            CapsuleError::Validation(_)
        ));
        assert!(matches!(
            h.manager
                .resize("vm1", None, Some(u64::MAX / 1024))
                .await
                .unwrap_err(),
            CapsuleError::Validation(_)
        ));
        assert_eq!(h.manager.get("vm1").unwrap().memory_mib, 1024);
    }

    #[tokio::test]
    async fn test_recover_resets_orphaned_states() {
        let h = harness();
        create_running(&h, "running").await;
        create_running(&h, "paused").await;
        h.manager.pause("paused").await.unwrap();
        h.manager
            .create(CreateVmRequest::new("stopped", LINUX_DEFAULT))
            .await
            .unwrap();

        // A fresh manager over the same home, as after a restart.
        let restarted = build_manager(&h.layout, FakeController::new());
        assert_eq!(restarted.recover().unwrap(), 2);
        assert_eq!(restarted.get("running").unwrap().state, VmState::Stopped);
        assert_eq!(restarted.get("paused").unwrap().state, VmState::Stopped);
        assert_eq!(restarted.get("stopped").unwrap().state, VmState::Stopped);
        assert_eq!(restarted.recover().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let h = harness();
        for name in ["a", "b", "c"] {
            h.manager
                .create(CreateVmRequest::new(name, LINUX_DEFAULT))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let names: Vec<String> = h.manager.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }

    fn snapshot_harness() -> (Harness, SnapshotManager) {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path().to_path_buf());
        layout.prepare().unwrap();
        let controller = FakeController::new();
        let locks = VmLocks::new();
        let manager = build_with_locks(&layout, controller.clone(), locks.clone());
        let snapshots = SnapshotManager::new(layout.snapshots_dir(), controller.clone(), locks);
        (
            Harness {
                _dir: dir,
                layout,
                controller,
                manager,
            },
            snapshots,
        )
    }

    #[tokio::test]
    async fn test_restore_uses_fresh_hypervisor() {
        let (h, snapshots) = snapshot_harness();
        create_running(&h, "vm1").await;
        snapshots
            .create_snapshot("vm1", CreateSnapshotRequest::new("s1"))
            .await
            .unwrap();
        let before = h.controller.calls().len();

        let meta = h.manager.restore_snapshot("vm1", &snapshots, "s1").await.unwrap();
        assert_eq!(meta.name, "s1");
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Running);

        let calls = h.controller.calls()[before..].to_vec();
        assert_eq!(
            calls,
            vec!["stop:vm1", "start:vm1", "restore:vm1", "resume:vm1"]
        );
        let vm = h.controller.vm("vm1").unwrap();
        assert!(vm.booted && !vm.paused);
        assert_eq!(
            PathBuf::from(vm.restored_from.unwrap()),
            h.layout.snapshots_dir().join("vm1/s1/snapshot.bin")
        );
    }

    #[tokio::test]
    async fn test_restore_into_stopped_vm() {
        let (h, snapshots) = snapshot_harness();
        create_running(&h, "vm1").await;
        snapshots
            .create_snapshot("vm1", CreateSnapshotRequest::new("s1"))
            .await
            .unwrap();
        h.manager.stop("vm1").await.unwrap();
        let before = h.controller.calls().len();

        h.manager.restore_snapshot("vm1", &snapshots, "s1").await.unwrap();
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Running);
        assert_eq!(
            h.controller.calls()[before..].to_vec(),
            vec!["stop:vm1", "start:vm1", "restore:vm1", "resume:vm1"]
        );
    }

    #[tokio::test]
    async fn test_restore_missing_snapshot_leaves_vm_alone() {
        let (h, snapshots) = snapshot_harness();
        create_running(&h, "vm1").await;
        let before = h.controller.calls().len();

        assert!(matches!(
            h.manager
                .restore_snapshot("vm1", &snapshots, "nope")
                .await
                .unwrap_err(),
            CapsuleError::NotFound(_)
        ));
        assert_eq!(h.controller.calls().len(), before);
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_restore_failure_ends_in_error() {
        let (h, snapshots) = snapshot_harness();
        create_running(&h, "vm1").await;
        snapshots
            .create_snapshot("vm1", CreateSnapshotRequest::new("s1"))
            .await
            .unwrap();
        h.controller.fail_on("restore");

        assert!(h.manager.restore_snapshot("vm1", &snapshots, "s1").await.is_err());
        assert_eq!(h.manager.get("vm1").unwrap().state, VmState::Error);
        assert!(!h.controller.has_session("vm1"));
    }

    #[tokio::test]
    async fn test_stop_and_delete_of_same_vm_do_not_interleave() {
        let h = harness();
        create_running(&h, "vm1").await;
        h.controller.set_delay(std::time::Duration::from_millis(20));
        let before = h.controller.calls().len();

        let (stopped, deleted) = tokio::join!(h.manager.stop("vm1"), h.manager.delete("vm1"));
        assert_eq!(stopped.unwrap().state, VmState::Stopped);
        deleted.unwrap();

        assert!(!h.controller.overlapped());
        assert_eq!(
            h.controller.calls()[before..].to_vec(),
            vec!["shutdown:vm1", "stop:vm1", "stop:vm1"]
        );
        assert!(h.manager.list().is_empty());
        assert!(!h.controller.has_session("vm1"));
    }

    #[tokio::test]
    async fn test_distinct_vms_proceed_in_parallel() {
        let h = harness();
        create_running(&h, "a").await;
        create_running(&h, "b").await;
        h.controller.set_delay(std::time::Duration::from_millis(20));

        let (a, b) = tokio::join!(h.manager.pause("a"), h.manager.pause("b"));
        assert_eq!(a.unwrap().state, VmState::Paused);
        assert_eq!(b.unwrap().state, VmState::Paused);
        assert!(!h.controller.overlapped());
    }

    #[tokio::test]
    async fn test_create_rejects_unbindable_socket_path() {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path().join("d".repeat(120)));
        layout.prepare().unwrap();
        let controller = FakeController::new();
        let manager = build_manager(&layout, controller.clone());

        let err = manager
            .create(CreateVmRequest::new("vm1", LINUX_DEFAULT))
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::Validation(_)));
        assert!(manager.list().is_empty());
        assert!(controller.calls().is_empty());
    }
}
