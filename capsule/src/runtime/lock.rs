//! Home directory ownership and per-VM operation serialization.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use capsule_shared::{CapsuleError, CapsuleResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::constants::filenames;

/// Exclusive claim on a home directory for the lifetime of one runtime.
///
/// Backed by `flock(2)` on `<home>/capsule.lock`, so the claim is released
/// when the runtime is dropped or its process dies.
pub struct RuntimeLock {
    _lock: Flock<File>,
}

impl RuntimeLock {
    pub fn acquire(home_dir: &Path) -> CapsuleResult<Self> {
        let path = home_dir.join(filenames::RUNTIME_LOCK);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!(path = %path.display(), "Acquired runtime lock");
                Ok(Self { _lock: lock })
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(CapsuleError::Config(format!(
                "home {} is in use by another runtime",
                home_dir.display()
            ))),
            Err((_, errno)) => Err(CapsuleError::Storage(format!(
                "Failed to lock {}: {}",
                path.display(),
                errno
            ))),
        }
    }
}

impl std::fmt::Debug for RuntimeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLock").finish_non_exhaustive()
    }
}

/// Keyed async mutex: one lock per VM name.
///
/// Lifecycle and snapshot operations hold the guard for the whole operation,
/// so `start`/`stop`/`delete`/snapshot calls on the same VM never interleave,
/// while distinct VMs proceed in parallel.
///
/// The guard is not reentrant. Internal helpers that run under a held guard
/// must not lock the same name again.
#[derive(Clone, Default)]
pub struct VmLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        entry.lock_owned().await
    }

    /// Drop lock entries that nobody holds or waits on.
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, entry| Arc::strong_count(entry) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
