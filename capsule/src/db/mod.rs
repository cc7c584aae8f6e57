//! Persistence layer for VM records.
//!
//! One JSON document per VM at `<home>/vms/<name>.json`. Writes go to a
//! temporary sibling and are renamed into place, so a crash mid-write never
//! leaves a truncated record behind.

use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};

use crate::vm::VmRecord;

/// Helper macro to convert I/O and JSON errors into storage errors with context.
macro_rules! store_err {
    ($result:expr, $($ctx:tt)*) => {
        $result.map_err(|e| CapsuleError::Storage(format!("{}: {}", format!($($ctx)*), e)))
    };
}

/// File-backed VM registry store.
#[derive(Debug, Clone)]
pub struct VmStore {
    dir: PathBuf,
}

impl VmStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: &Path) -> CapsuleResult<Self> {
        store_err!(
            std::fs::create_dir_all(dir),
            "Failed to create VM store at {}",
            dir.display()
        )?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Persist a record, replacing any previous version.
    pub fn save(&self, record: &VmRecord) -> CapsuleResult<()> {
        let path = self.record_path(&record.name);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.name));

        let json = store_err!(
            serde_json::to_vec_pretty(record),
            "Failed to serialize VM {}",
            record.name
        )?;
        store_err!(std::fs::write(&tmp, json), "Failed to write {}", tmp.display())?;
        store_err!(
            std::fs::rename(&tmp, &path),
            "Failed to commit {}",
            path.display()
        )?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> CapsuleResult<Option<VmRecord>> {
        let path = self.record_path(name);
        match std::fs::read(&path) {
            Ok(raw) => Ok(Some(store_err!(
                serde_json::from_slice(&raw),
                "Corrupt VM record {}",
                path.display()
            )?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CapsuleError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Delete a record. Deleting a missing record is not an error.
    pub fn delete(&self, name: &str) -> CapsuleResult<()> {
        let path = self.record_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CapsuleError::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load every record in the store.
    ///
    /// Unreadable or corrupt files are logged and skipped so one bad record
    /// cannot prevent the runtime from starting.
    pub fn list_all(&self) -> CapsuleResult<Vec<VmRecord>> {
        let entries = store_err!(
            std::fs::read_dir(&self.dir),
            "Failed to list {}",
            self.dir.display()
        )?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match self.load(name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping VM record"),
            }
        }
        Ok(records)
    }
}
