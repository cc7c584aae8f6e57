use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::OsKind;

/// VM lifecycle state.
///
/// ```text
///            create
///   (none) ──────────► Creating ──► Stopped ◄──────────┐
///                          │          │ start          │ stop
///                          ▼          ▼                │
///                        Error ◄── Running ◄──► Paused ┘
///                                     pause / resume
/// ```
///
/// `Creating` is transient: no public operation returns while a record is in
/// it. Any communication failure during a mutating operation lands in `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Creating,
    Stopped,
    Running,
    Paused,
    Error,
}

impl VmState {
    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Stopped)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, VmState::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, VmState::Paused)
    }

    /// Restoring replaces the hypervisor wholesale, so only a VM still being
    /// created is off limits.
    pub fn can_restore(&self) -> bool {
        !matches!(self, VmState::Creating)
    }

    /// Whether a hypervisor process is expected to be alive in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, VmState::Running | VmState::Paused)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmState::Creating => "CREATING",
            VmState::Stopped => "STOPPED",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Persisted VM record. Serialized verbatim to `vms/<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub state: VmState,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub os: OsKind,
    pub template: String,
    pub guest_agent: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn set_state(&mut self, state: VmState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
