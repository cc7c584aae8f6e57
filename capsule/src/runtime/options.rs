//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use capsule_shared::{CapsuleError, CapsuleResult};
use serde::{Deserialize, Serialize};

use super::constants::{envs, filenames, guest, hypervisor, snapshots};

/// Options for a [`CapsuleRuntime`](super::CapsuleRuntime).
///
/// Every field has a default, so a `config.toml` only needs the keys it
/// overrides:
///
/// ```toml
/// hypervisor_binary = "/usr/local/bin/cloud-hypervisor"
/// max_snapshots_per_vm = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsuleOptions {
    /// Root of all persisted state. Must be absolute.
    pub home_dir: PathBuf,
    /// Hypervisor executable, resolved through `PATH` if not absolute.
    pub hypervisor_binary: PathBuf,
    pub socket_ready_attempts: u32,
    pub socket_ready_interval_ms: u64,
    pub stop_grace_period_secs: u64,
    pub guest_connect_timeout_secs: u64,
    pub guest_command_timeout_secs: u64,
    /// Vsock port of the agent inside Linux guests.
    pub guest_agent_port: u32,
    pub max_snapshots_per_vm: usize,
    pub snapshot_retention_days: u32,
}

impl Default for CapsuleOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            hypervisor_binary: PathBuf::from(hypervisor::DEFAULT_BINARY),
            socket_ready_attempts: hypervisor::SOCKET_READY_ATTEMPTS,
            socket_ready_interval_ms: hypervisor::SOCKET_READY_INTERVAL_MS,
            stop_grace_period_secs: hypervisor::STOP_GRACE_PERIOD_SECS,
            guest_connect_timeout_secs: guest::CONNECT_TIMEOUT_SECS,
            guest_command_timeout_secs: guest::COMMAND_TIMEOUT_SECS,
            guest_agent_port: guest::AGENT_VSOCK_PORT,
            max_snapshots_per_vm: snapshots::MAX_PER_VM,
            snapshot_retention_days: snapshots::RETENTION_DAYS,
        }
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(envs::CAPSULE_HOME)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".capsule"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/capsule"))
}

impl CapsuleOptions {
    /// Defaults rooted at `home_dir`, without reading any config file.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }

    /// Load `<home>/config.toml` on top of the defaults.
    ///
    /// A missing file is not an error. `home_dir` always comes from the
    /// argument (or the default), never from the file itself.
    pub fn load(home_dir: Option<&Path>) -> CapsuleResult<Self> {
        let home_dir = home_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(default_home_dir);
        let config_path = home_dir.join(filenames::CONFIG);

        let mut options = match std::fs::read_to_string(&config_path) {
            Ok(raw) => toml::from_str::<CapsuleOptions>(&raw).map_err(|e| {
                CapsuleError::Config(format!(
                    "Failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        options.home_dir = home_dir;

        tracing::debug!(config = %config_path.display(), "Loaded runtime options");
        Ok(options)
    }

    /// Reject configurations the runtime cannot operate with.
    pub fn sanitize(&self) -> CapsuleResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(CapsuleError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }
        if self.socket_ready_attempts == 0 {
            return Err(CapsuleError::Config(
                "socket_ready_attempts must be at least 1".into(),
            ));
        }
        if self.max_snapshots_per_vm == 0 {
            return Err(CapsuleError::Config(
                "max_snapshots_per_vm must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn socket_ready_interval(&self) -> Duration {
        Duration::from_millis(self.socket_ready_interval_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    pub fn guest_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_connect_timeout_secs)
    }

    pub fn guest_command_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_without_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let options = CapsuleOptions::load(Some(temp.path())).unwrap();

        assert_eq!(options.home_dir, temp.path());
        assert_eq!(options.max_snapshots_per_vm, 10);
        assert_eq!(options.socket_ready_attempts, 30);
        assert_eq!(options.stop_grace_period(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_overlays_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            "max_snapshots_per_vm = 3\nhypervisor_binary = \"/opt/ch/cloud-hypervisor\"\nhome_dir = \"/ignored\"\n",
        )
        .unwrap();

        let options = CapsuleOptions::load(Some(temp.path())).unwrap();
        assert_eq!(options.max_snapshots_per_vm, 3);
        assert_eq!(
            options.hypervisor_binary,
            PathBuf::from("/opt/ch/cloud-hypervisor")
        );
        assert_eq!(options.home_dir, temp.path());
        assert_eq!(options.snapshot_retention_days, 30);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "max_snapshots_per_vm = \"many\"").unwrap();

        let err = CapsuleOptions::load(Some(temp.path())).unwrap_err();
        assert!(matches!(err, CapsuleError::Config(_)));
    }

    #[test]
    fn test_sanitize() {
        assert!(CapsuleOptions::with_home("/tmp/capsule").sanitize().is_ok());
        assert!(CapsuleOptions::with_home("relative").sanitize().is_err());

        let mut options = CapsuleOptions::with_home("/tmp/capsule");
        options.max_snapshots_per_vm = 0;
        assert!(options.sanitize().is_err());
    }
}
