//! Thread-safe VM registry.

use std::collections::HashMap;
use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult};
use parking_lot::RwLock;

use crate::db::VmStore;
use crate::vm::{VmRecord, VmState};

/// Registry of VM records backed by [`VmStore`].
///
/// # Design
///
/// - **Shared ownership**: Cloneable via `Arc`
/// - **Concurrent access**: RwLock allows multiple readers, single writer
/// - **Store-first**: Every mutation is persisted before the cache changes,
///   so the cache never holds a state that did not reach disk
#[derive(Clone)]
pub struct VmManager {
    inner: Arc<RwLock<VmManagerInner>>,
}

struct VmManagerInner {
    vms: HashMap<String, VmRecord>,
    store: VmStore,
}

impl std::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmManager").finish()
    }
}

impl VmManager {
    /// Create a manager and load every persisted record into the cache.
    pub fn open(store: VmStore) -> CapsuleResult<Self> {
        let vms = store
            .list_all()?
            .into_iter()
            .map(|r| (r.name.clone(), r))
            .collect::<HashMap<_, _>>();

        tracing::debug!(count = vms.len(), "Loaded VM registry");

        Ok(Self {
            inner: Arc::new(RwLock::new(VmManagerInner { vms, store })),
        })
    }

    /// Register a new VM.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a VM with this name is registered.
    pub fn register(&self, record: VmRecord) -> CapsuleResult<()> {
        let mut inner = self.inner.write();

        if inner.vms.contains_key(&record.name) {
            return Err(CapsuleError::AlreadyExists(format!(
                "VM {} already exists",
                record.name
            )));
        }

        inner.store.save(&record)?;

        tracing::debug!(vm = %record.name, state = ?record.state, "Registering VM");
        inner.vms.insert(record.name.clone(), record);
        Ok(())
    }

    /// Apply `f` to a record and persist the result.
    ///
    /// Store-first: the mutated copy is saved before replacing the cached one.
    pub fn update<F>(&self, name: &str, f: F) -> CapsuleResult<VmRecord>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut inner = self.inner.write();

        let mut record = inner
            .vms
            .get(name)
            .cloned()
            .ok_or_else(|| CapsuleError::NotFound(format!("VM {}", name)))?;
        f(&mut record);

        inner.store.save(&record)?;
        inner.vms.insert(name.to_string(), record.clone());
        Ok(record)
    }

    /// Persist a new state for a VM.
    pub fn update_state(&self, name: &str, state: VmState) -> CapsuleResult<VmRecord> {
        let record = self.update(name, |r| {
            tracing::debug!(vm = %r.name, old_state = ?r.state, new_state = ?state, "Updating VM state");
            r.set_state(state);
        })?;
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Option<VmRecord> {
        self.inner.read().vms.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().vms.contains_key(name)
    }

    /// List all VMs, sorted by creation time (newest first).
    pub fn list(&self) -> Vec<VmRecord> {
        let inner = self.inner.read();
        let mut records: Vec<VmRecord> = inner.vms.values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        records
    }

    /// Remove a VM record. Store-first.
    pub fn remove(&self, name: &str) -> CapsuleResult<VmRecord> {
        let mut inner = self.inner.write();

        if !inner.vms.contains_key(name) {
            return Err(CapsuleError::NotFound(format!("VM {}", name)));
        }

        inner.store.delete(name)?;

        tracing::debug!(vm = %name, "Removing VM from registry");
        inner
            .vms
            .remove(name)
            .ok_or_else(|| CapsuleError::NotFound(format!("VM {}", name)))
    }
}
