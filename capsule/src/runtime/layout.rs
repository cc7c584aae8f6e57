use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};

use super::constants::{dirs, filenames, hypervisor};

/// On-disk layout rooted at the capsule home directory.
///
/// ```text
/// <home>/
///   config.toml
///   vms/<vm>.json
///   snapshots/<vm>/<snapshot>/{snapshot.bin, metadata.json}
///   sockets/<vm>.api.sock, <vm>.vsock
///   templates/<name>.toml
///   images/
///   logs/
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.home_dir.join(filenames::CONFIG)
    }

    pub fn vms_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::VMS)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::SNAPSHOTS)
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::SOCKETS)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::TEMPLATES)
    }

    /// Default location for kernels, firmware, and disk images referenced by
    /// relative paths in templates.
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES)
    }

    /// Hypervisor control (API) socket for a VM.
    pub fn api_socket_path(&self, vm_name: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.api.sock", vm_name))
    }

    /// Host end of the guest agent vsock channel for a VM.
    pub fn guest_socket_path(&self, vm_name: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.vsock", vm_name))
    }

    /// Reject a VM whose sockets could not be bound under this home.
    ///
    /// Unix socket paths are limited by `sun_path`; a deep home directory
    /// combined with a long VM name would otherwise only fail when the
    /// hypervisor starts.
    pub fn check_socket_paths(&self, vm_name: &str) -> CapsuleResult<()> {
        for path in [self.api_socket_path(vm_name), self.guest_socket_path(vm_name)] {
            let len = path.as_os_str().len();
            if len > hypervisor::MAX_SOCKET_PATH_LEN {
                return Err(CapsuleError::Validation(format!(
                    "socket path {} is {} bytes, limit is {}",
                    path.display(),
                    len,
                    hypervisor::MAX_SOCKET_PATH_LEN
                )));
            }
        }
        Ok(())
    }

    /// Serial console log used when a template asks for file-backed serial.
    pub fn serial_log_path(&self, vm_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.serial.log", vm_name))
    }

    /// Create all top-level directories.
    pub fn prepare(&self) -> CapsuleResult<()> {
        for dir in [
            self.vms_dir(),
            self.snapshots_dir(),
            self.sockets_dir(),
            self.logs_dir(),
            self.templates_dir(),
            self.images_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
