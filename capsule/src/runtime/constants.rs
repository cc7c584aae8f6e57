//! Runtime-wide constants.

/// Directory and file names under the capsule home directory.
pub mod dirs {
    pub const VMS: &str = "vms";
    pub const SNAPSHOTS: &str = "snapshots";
    pub const SOCKETS: &str = "sockets";
    pub const LOGS: &str = "logs";
    pub const TEMPLATES: &str = "templates";
    pub const IMAGES: &str = "images";
}

pub mod filenames {
    pub const CONFIG: &str = "config.toml";
    pub const RUNTIME_LOCK: &str = "capsule.lock";
    pub const SNAPSHOT_BLOB: &str = "snapshot.bin";
    pub const SNAPSHOT_METADATA: &str = "metadata.json";
}

/// Environment variables read by the runtime.
pub mod envs {
    /// Overrides the default home directory (`~/.capsule`).
    pub const CAPSULE_HOME: &str = "CAPSULE_HOME";
}

/// Hypervisor process supervision defaults.
pub mod hypervisor {
    pub const DEFAULT_BINARY: &str = "cloud-hypervisor";

    /// Control socket readiness polling.
    pub const SOCKET_READY_ATTEMPTS: u32 = 30;
    pub const SOCKET_READY_INTERVAL_MS: u64 = 100;

    /// Time between SIGTERM and SIGKILL when stopping the hypervisor.
    pub const STOP_GRACE_PERIOD_SECS: u64 = 10;

    /// Upper bound on a single control API round trip. Snapshot and restore
    /// of large guests dominate this.
    pub const API_REQUEST_TIMEOUT_SECS: u64 = 300;

    /// Context ID assigned to the guest side of the vsock channel.
    pub const GUEST_VSOCK_CID: u32 = 3;

    /// `sun_path` capacity minus the trailing NUL.
    pub const MAX_SOCKET_PATH_LEN: usize = 107;

    /// Linux IFNAMSIZ minus the trailing NUL.
    pub const MAX_TAP_NAME_LEN: usize = 15;
}

/// Guest agent RPC defaults.
pub mod guest {
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const COMMAND_TIMEOUT_SECS: u64 = 300;

    /// Extra time allowed on top of a command's own timeout for the RPC round trip.
    pub const EXEC_TIMEOUT_SLACK_SECS: u64 = 5;

    pub const DEFAULT_DOWNLOAD_MAX_BYTES: u64 = 100 * 1024 * 1024;

    /// Vsock port the agent listens on inside Linux guests.
    pub const AGENT_VSOCK_PORT: u32 = 1024;

    /// Windows guests are reached over `\\.\pipe\capsule-<vm>`.
    pub const PIPE_PREFIX: &str = r"\\.\pipe\capsule-";
}

/// Snapshot retention defaults.
pub mod snapshots {
    pub const MAX_PER_VM: usize = 10;
    pub const RETENTION_DAYS: u32 = 30;

    /// Chunk size used when streaming blobs through SHA-256.
    pub const CHECKSUM_CHUNK_BYTES: usize = 64 * 1024;

    /// Version tag written into every `metadata.json`.
    pub const METADATA_SCHEMA_VERSION: u32 = 1;
}
