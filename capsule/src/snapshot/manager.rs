use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use super::metadata::SnapshotMetadata;
use crate::runtime::constants::{filenames, snapshots};
use crate::runtime::{VmLocks, validate_name};
use crate::util::checksum::{digests_match, sha256_file};
use crate::vmm::controller::VmmController;

/// Arguments for [`SnapshotManager::create_snapshot`].
#[derive(Debug, Clone, Default)]
pub struct CreateSnapshotRequest {
    pub name: String,
    pub description: String,
    pub incremental: bool,
    /// Existing snapshot of the same VM this one descends from.
    pub parent: Option<String>,
}

impl CreateSnapshotRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub expected_checksum: String,
    pub actual_checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VmSnapshotStatistics {
    pub count: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStatistics {
    pub total_count: usize,
    pub total_size_bytes: u64,
    pub per_vm: BTreeMap<String, VmSnapshotStatistics>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Captures and restores VM state through the hypervisor, and owns the
/// snapshot directory tree.
///
/// Public operations take the per-VM lock shared with the lifecycle manager.
/// `*_locked` helpers assume the caller already holds it.
pub struct SnapshotManager {
    root: PathBuf,
    controller: Arc<dyn VmmController>,
    locks: VmLocks,
    max_per_vm: usize,
    retention_days: u32,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("root", &self.root)
            .field("max_per_vm", &self.max_per_vm)
            .field("retention_days", &self.retention_days)
            .finish()
    }
}

impl SnapshotManager {
    pub fn new(root: PathBuf, controller: Arc<dyn VmmController>, locks: VmLocks) -> Self {
        Self {
            root,
            controller,
            locks,
            max_per_vm: snapshots::MAX_PER_VM,
            retention_days: snapshots::RETENTION_DAYS,
        }
    }

    pub fn with_limits(mut self, max_per_vm: usize, retention_days: u32) -> Self {
        self.max_per_vm = max_per_vm.max(1);
        self.retention_days = retention_days;
        self
    }

    fn vm_dir(&self, vm: &str) -> PathBuf {
        self.root.join(vm)
    }

    fn snapshot_dir(&self, vm: &str, name: &str) -> PathBuf {
        self.vm_dir(vm).join(name)
    }

    fn blob_path(&self, vm: &str, name: &str) -> PathBuf {
        self.snapshot_dir(vm, name).join(filenames::SNAPSHOT_BLOB)
    }

    fn metadata_path(&self, vm: &str, name: &str) -> PathBuf {
        self.snapshot_dir(vm, name).join(filenames::SNAPSHOT_METADATA)
    }

    /// Capture the VM's current state.
    ///
    /// When the VM already has `max_per_vm` snapshots, the oldest are removed
    /// first (never the requested parent). If the hypervisor fails, the
    /// partial snapshot directory is removed and the error is returned.
    pub async fn create_snapshot(
        &self,
        vm: &str,
        request: CreateSnapshotRequest,
    ) -> CapsuleResult<SnapshotMetadata> {
        validate_name("VM", vm)?;
        validate_name("snapshot", &request.name)?;
        if let Some(parent) = &request.parent {
            validate_name("parent snapshot", parent)?;
        }

        let _guard = self.locks.lock(vm).await;

        let dir = self.snapshot_dir(vm, &request.name);
        if tokio::fs::try_exists(&dir).await? {
            return Err(CapsuleError::AlreadyExists(format!(
                "snapshot {} of VM {}",
                request.name, vm
            )));
        }

        if let Some(parent) = &request.parent
            && !tokio::fs::try_exists(self.metadata_path(vm, parent)).await?
        {
            return Err(CapsuleError::Validation(format!(
                "parent snapshot {} does not exist for VM {}",
                parent, vm
            )));
        }

        self.enforce_limit_locked(vm, request.parent.as_deref())
            .await?;

        tokio::fs::create_dir_all(&dir).await?;
        let blob = self.blob_path(vm, &request.name);

        let result = self.capture_locked(vm, &request, &blob).await;
        if result.is_err()
            && let Err(e) = tokio::fs::remove_dir_all(&dir).await
        {
            tracing::warn!(vm, snapshot = %request.name, error = %e, "Failed to remove partial snapshot");
        }
        result
    }

    async fn capture_locked(
        &self,
        vm: &str,
        request: &CreateSnapshotRequest,
        blob: &Path,
    ) -> CapsuleResult<SnapshotMetadata> {
        tracing::info!(vm, snapshot = %request.name, "Capturing snapshot");
        self.controller.snapshot(vm, blob).await?;

        let size_bytes = match tokio::fs::metadata(blob).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::Protocol(format!(
                    "hypervisor reported success but wrote no snapshot to {}",
                    blob.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let checksum = sha256_file(blob).await?;

        let metadata = SnapshotMetadata {
            name: request.name.clone(),
            vm_name: vm.to_string(),
            description: request.description.clone(),
            created_at: Utc::now(),
            size_bytes,
            checksum,
            incremental: request.incremental,
            parent: request.parent.clone(),
            schema_version: snapshots::METADATA_SCHEMA_VERSION,
        };
        metadata
            .save(&self.metadata_path(vm, &request.name))
            .await?;

        tracing::info!(
            vm,
            snapshot = %metadata.name,
            size_bytes,
            checksum = %metadata.checksum,
            "Snapshot created"
        );
        Ok(metadata)
    }

    /// Delete the oldest snapshots so that one more fits under the limit.
    async fn enforce_limit_locked(&self, vm: &str, keep: Option<&str>) -> CapsuleResult<()> {
        let existing = self.list_locked(vm).await?;
        if existing.len() < self.max_per_vm {
            return Ok(());
        }

        let excess = existing.len() + 1 - self.max_per_vm;
        // Oldest first.
        let victims: Vec<&SnapshotMetadata> = existing
            .iter()
            .rev()
            .filter(|s| Some(s.name.as_str()) != keep)
            .take(excess)
            .collect();

        for victim in victims {
            tracing::info!(vm, snapshot = %victim.name, limit = self.max_per_vm, "Removing oldest snapshot to stay under limit");
            tokio::fs::remove_dir_all(self.snapshot_dir(vm, &victim.name)).await?;
        }
        Ok(())
    }

    /// Snapshots of `vm`, newest first. A VM with no snapshot directory has none.
    pub async fn list_snapshots(&self, vm: &str) -> CapsuleResult<Vec<SnapshotMetadata>> {
        validate_name("VM", vm)?;
        let _guard = self.locks.lock(vm).await;
        self.list_locked(vm).await
    }

    async fn list_locked(&self, vm: &str) -> CapsuleResult<Vec<SnapshotMetadata>> {
        let mut entries = match tokio::fs::read_dir(self.vm_dir(vm)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(filenames::SNAPSHOT_METADATA);
            match SnapshotMetadata::load(&path).await {
                Ok(meta) => snapshots.push(meta),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot")
                }
            }
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(snapshots)
    }

    /// Metadata and blob path of a snapshot about to be restored.
    ///
    /// The caller holds the VM lock. `NotFound` if the snapshot or its blob
    /// is missing.
    pub(crate) async fn restore_source_locked(
        &self,
        vm: &str,
        name: &str,
    ) -> CapsuleResult<(SnapshotMetadata, PathBuf)> {
        validate_name("snapshot", name)?;
        let metadata = self.load_locked(vm, name).await?;
        let blob = self.blob_path(vm, name);
        if !tokio::fs::try_exists(&blob).await? {
            return Err(CapsuleError::NotFound(format!(
                "snapshot blob for {} of VM {}",
                name, vm
            )));
        }
        Ok((metadata, blob))
    }

    pub async fn delete_snapshot(&self, vm: &str, name: &str) -> CapsuleResult<()> {
        validate_name("VM", vm)?;
        validate_name("snapshot", name)?;
        let _guard = self.locks.lock(vm).await;
        self.delete_locked(vm, name).await
    }

    async fn delete_locked(&self, vm: &str, name: &str) -> CapsuleResult<()> {
        let dir = self.snapshot_dir(vm, name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::NotFound(format!(
                    "snapshot {} of VM {}",
                    name, vm
                )));
            }
            Err(e) => return Err(e.into()),
        }

        // Drop the per-VM directory once it is empty; ignore failures.
        let _ = tokio::fs::remove_dir(self.vm_dir(vm)).await;

        tracing::info!(vm, snapshot = name, "Snapshot deleted");
        Ok(())
    }

    async fn load_locked(&self, vm: &str, name: &str) -> CapsuleResult<SnapshotMetadata> {
        SnapshotMetadata::load(&self.metadata_path(vm, name))
            .await
            .map_err(|e| match e {
                CapsuleError::NotFound(_) => {
                    CapsuleError::NotFound(format!("snapshot {} of VM {}", name, vm))
                }
                other => other,
            })
    }

    /// Recompute the blob checksum and compare it to the recorded one.
    ///
    /// A mismatch is reported in the result, not raised.
    pub async fn verify_snapshot_integrity(
        &self,
        vm: &str,
        name: &str,
    ) -> CapsuleResult<IntegrityReport> {
        validate_name("VM", vm)?;
        validate_name("snapshot", name)?;
        let _guard = self.locks.lock(vm).await;

        let metadata = self.load_locked(vm, name).await?;
        let blob = self.blob_path(vm, name);
        let size_bytes = match tokio::fs::metadata(&blob).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::NotFound(format!(
                    "snapshot blob for {} of VM {}",
                    name, vm
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = sha256_file(&blob).await?;
        let valid = digests_match(&actual, &metadata.checksum);

        if !valid {
            tracing::warn!(vm, snapshot = name, expected = %metadata.checksum, actual = %actual, "Snapshot checksum mismatch");
        }

        Ok(IntegrityReport {
            valid,
            expected_checksum: metadata.checksum,
            actual_checksum: actual,
            size_bytes,
        })
    }

    /// Remove snapshots older than `days_old` (default: configured retention)
    /// across all VMs. Individual failures are counted, not raised.
    pub async fn cleanup_old_snapshots(&self, days_old: Option<u32>) -> CapsuleResult<CleanupReport> {
        let days = days_old.unwrap_or(self.retention_days);
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut report = CleanupReport::default();

        for vm in self.vm_names().await? {
            let _guard = self.locks.lock(&vm).await;
            let snapshots = match self.list_locked(&vm).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(vm = %vm, error = %e, "Failed to list snapshots during cleanup");
                    report.errors += 1;
                    continue;
                }
            };

            for snapshot in snapshots.iter().filter(|s| s.created_at < cutoff) {
                match self.delete_locked(&vm, &snapshot.name).await {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        tracing::warn!(vm = %vm, snapshot = %snapshot.name, error = %e, "Failed to remove expired snapshot");
                        report.errors += 1;
                    }
                }
            }
        }

        tracing::info!(days, removed = report.removed, errors = report.errors, "Snapshot cleanup finished");
        Ok(report)
    }

    /// Aggregate counts and sizes across all VMs.
    pub async fn get_snapshot_statistics(&self) -> CapsuleResult<SnapshotStatistics> {
        let mut stats = SnapshotStatistics::default();

        for vm in self.vm_names().await? {
            let snapshots = {
                let _guard = self.locks.lock(&vm).await;
                self.list_locked(&vm).await?
            };
            if snapshots.is_empty() {
                continue;
            }

            let entry = stats.per_vm.entry(vm).or_default();
            for snapshot in &snapshots {
                entry.count += 1;
                entry.size_bytes += snapshot.size_bytes;
                stats.total_count += 1;
                stats.total_size_bytes += snapshot.size_bytes;
                stats.oldest = Some(match stats.oldest {
                    Some(t) => t.min(snapshot.created_at),
                    None => snapshot.created_at,
                });
                stats.newest = Some(match stats.newest {
                    Some(t) => t.max(snapshot.created_at),
                    None => snapshot.created_at,
                });
            }
        }

        Ok(stats)
    }

    async fn vm_names(&self) -> CapsuleResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
