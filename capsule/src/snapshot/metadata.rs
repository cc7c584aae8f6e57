use std::path::Path;

use capsule_shared::{CapsuleError, CapsuleResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of `snapshots/<vm>/<name>/metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub name: String,
    pub vm_name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of `snapshot.bin`.
    pub checksum: String,
    /// Lineage label only. Every blob is a full capture.
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub parent: Option<String>,
    pub schema_version: u32,
}

impl SnapshotMetadata {
    pub(crate) async fn load(path: &Path) -> CapsuleResult<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CapsuleError::NotFound(format!(
                    "snapshot metadata {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| {
            CapsuleError::Storage(format!("Corrupt snapshot metadata {}: {}", path.display(), e))
        })
    }

    /// Write atomically (temp file + rename).
    pub(crate) async fn save(&self, path: &Path) -> CapsuleResult<()> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
