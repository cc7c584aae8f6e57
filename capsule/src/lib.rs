//! capsule - control plane for disposable microVM sandboxes.
//!
//! ## Architecture
//!
//! ```text
//! CapsuleRuntime
//!   ├─► vm::LifecycleManager     (state machine + durable registry)
//!   │       └─► vmm::VmmController  (hypervisor subprocess + control socket)
//!   ├─► snapshot::SnapshotManager (capture/restore, checksums, retention)
//!   │       └─► vmm::VmmController
//!   └─► portal::GuestSession      (framed RPC to the in-guest agent)
//! ```
//!
//! Every lifecycle and snapshot operation on a VM name is serialized through a
//! per-name lock; operations on distinct names run concurrently.

pub mod db;
pub mod portal;
pub mod runtime;
pub mod snapshot;
pub mod util;
pub mod vm;
pub mod vmm;

mod logging;

pub use capsule_shared::{CapsuleError, CapsuleResult, Transport};
pub use logging::init_logging_for;
pub use portal::GuestSession;
pub use runtime::{CapsuleOptions, CapsuleRuntime, FilesystemLayout, OsKind};
pub use snapshot::{
    CleanupReport, IntegrityReport, SnapshotManager, SnapshotMetadata, SnapshotStatistics,
};
pub use vm::{CreateVmRequest, LifecycleManager, VmRecord, VmState, VmStatus};
pub use vmm::controller::{CloudHypervisorController, VmmController};
