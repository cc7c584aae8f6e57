//! Point-in-time VM snapshots: capture, restore, integrity, retention.
//!
//! On disk: `<home>/snapshots/<vm>/<name>/{snapshot.bin, metadata.json}`.

mod manager;
mod metadata;

pub use manager::{
    CleanupReport, CreateSnapshotRequest, IntegrityReport, SnapshotManager, SnapshotStatistics,
    VmSnapshotStatistics,
};
pub use metadata::SnapshotMetadata;
