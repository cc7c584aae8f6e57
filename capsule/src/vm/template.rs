//! VM templates: named resource and boot presets.
//!
//! Two templates are built in (`linux-default`, `windows-default`). A TOML
//! file at `<home>/templates/<name>.toml` defines a user template and shadows
//! a built-in of the same name:
//!
//! ```toml
//! os = "linux"
//! vcpus = 4
//! memory_mib = 2048
//! rootfs = "ubuntu-24.04.ext4"
//!
//! [boot]
//! type = "kernel"
//! kernel = "vmlinux-6.6"
//! cmdline = "console=ttyS0 root=/dev/vda rw"
//!
//! [network]
//! mac = "52:54:00:aa:bb:cc"
//! ```
//!
//! Relative paths resolve against `<home>/images`.

use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};
use serde::{Deserialize, Serialize};

use crate::runtime::constants::hypervisor::{GUEST_VSOCK_CID, MAX_TAP_NAME_LEN};
use crate::runtime::{FilesystemLayout, OsKind, validate_name};
use crate::vmm::{
    BootSource, CpuTopology, DiskSpec, GuestChannel, HotplugMethod, NetworkSpec, SerialConsole,
    VmmConfig,
};

pub const LINUX_DEFAULT: &str = "linux-default";
pub const WINDOWS_DEFAULT: &str = "windows-default";

/// Smallest memory size accepted for any VM.
pub const MIN_MEMORY_MIB: u64 = 128;

/// Largest memory size accepted for any VM (16 TiB).
pub const MAX_MEMORY_MIB: u64 = 16 * 1024 * 1024;

/// Largest vCPU count cloud-hypervisor boots.
pub const MAX_VCPUS: u32 = 254;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialMode {
    #[default]
    Pty,
    /// Written to `<home>/logs/<vm>.serial.log`.
    File,
    Off,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateNetwork {
    /// Defaults to `tap-<vm>` (truncated to the interface name limit).
    #[serde(default)]
    pub tap: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    #[serde(default)]
    pub os: OsKind,
    pub vcpus: u32,
    pub memory_mib: u64,
    #[serde(default)]
    pub max_vcpus: Option<u32>,
    #[serde(default)]
    pub topology: Option<CpuTopology>,
    #[serde(default)]
    pub hugepages: bool,
    #[serde(default)]
    pub hotplug_method: Option<HotplugMethod>,
    pub boot: BootSource,
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub uefi_disk: Option<PathBuf>,
    #[serde(default)]
    pub driver_media: Vec<PathBuf>,
    #[serde(default)]
    pub network: Option<TemplateNetwork>,
    #[serde(default)]
    pub serial: SerialMode,
    #[serde(default = "default_true")]
    pub guest_agent: bool,
}

impl Template {
    pub fn linux_default() -> Self {
        Self {
            os: OsKind::Linux,
            vcpus: 2,
            memory_mib: 512,
            max_vcpus: None,
            topology: None,
            hugepages: false,
            hotplug_method: None,
            boot: BootSource::Kernel {
                kernel: PathBuf::from("vmlinux"),
                cmdline: "console=ttyS0 root=/dev/vda rw".to_string(),
                initramfs: None,
            },
            rootfs: Some(PathBuf::from("linux-rootfs.ext4")),
            disks: Vec::new(),
            uefi_disk: None,
            driver_media: Vec::new(),
            network: None,
            serial: SerialMode::Pty,
            guest_agent: true,
        }
    }

    pub fn windows_default() -> Self {
        Self {
            os: OsKind::Windows,
            vcpus: 2,
            memory_mib: 4096,
            max_vcpus: None,
            topology: None,
            hugepages: false,
            hotplug_method: None,
            boot: BootSource::Firmware {
                firmware: PathBuf::from("CLOUDHV.fd"),
            },
            rootfs: None,
            disks: Vec::new(),
            uefi_disk: Some(PathBuf::from("windows.img")),
            driver_media: vec![PathBuf::from("virtio-win.iso")],
            network: None,
            serial: SerialMode::File,
            guest_agent: true,
        }
    }

    fn builtin(name: &str) -> Option<Self> {
        match name {
            LINUX_DEFAULT => Some(Self::linux_default()),
            WINDOWS_DEFAULT => Some(Self::windows_default()),
            _ => None,
        }
    }

    /// Resolve this template into a hypervisor configuration for one VM.
    pub fn to_vmm_config(
        &self,
        vm_name: &str,
        vcpus: u32,
        memory_mib: u64,
        layout: &FilesystemLayout,
    ) -> VmmConfig {
        let images = layout.images_dir();
        let abs = |p: &Path| resolve_path(&images, p);

        let boot = match &self.boot {
            BootSource::Kernel {
                kernel,
                cmdline,
                initramfs,
            } => BootSource::Kernel {
                kernel: abs(kernel),
                cmdline: cmdline.clone(),
                initramfs: initramfs.as_deref().map(abs),
            },
            BootSource::Firmware { firmware } => BootSource::Firmware {
                firmware: abs(firmware),
            },
        };

        let disks = self
            .disks
            .iter()
            .map(|d| DiskSpec {
                path: abs(&d.path),
                ..d.clone()
            })
            .collect();

        let network = self.network.as_ref().map(|n| NetworkSpec {
            tap: n.tap.clone().unwrap_or_else(|| default_tap_name(vm_name)),
            mac: n.mac.clone(),
        });

        let serial = match self.serial {
            SerialMode::Pty => SerialConsole::Pty,
            SerialMode::File => SerialConsole::File(layout.serial_log_path(vm_name)),
            SerialMode::Off => SerialConsole::Off,
        };

        let guest_channel = self.guest_agent.then(|| GuestChannel {
            cid: GUEST_VSOCK_CID,
            socket: layout.guest_socket_path(vm_name),
        });

        VmmConfig {
            vm_name: vm_name.to_string(),
            os: self.os,
            vcpus,
            max_vcpus: self.max_vcpus,
            topology: self.topology,
            memory_mib,
            hugepages: self.hugepages,
            hotplug_method: self.hotplug_method,
            boot,
            rootfs: self.rootfs.as_deref().map(abs),
            disks,
            uefi_disk: self.uefi_disk.as_deref().map(abs),
            driver_media: self.driver_media.iter().map(|p| abs(p)).collect(),
            network,
            serial,
            api_socket: layout.api_socket_path(vm_name),
            guest_channel,
        }
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// `tap-<vm>`, cut to the kernel's interface name limit.
pub fn default_tap_name(vm_name: &str) -> String {
    let mut name = format!("tap-{}", vm_name);
    name.truncate(MAX_TAP_NAME_LEN);
    name
}

/// Check sizes against the hard bounds.
pub fn validate_resources(vcpus: u32, memory_mib: u64) -> CapsuleResult<()> {
    if !(1..=MAX_VCPUS).contains(&vcpus) {
        return Err(CapsuleError::Validation(format!(
            "vcpus must be between 1 and {}, got {}",
            MAX_VCPUS, vcpus
        )));
    }
    if !(MIN_MEMORY_MIB..=MAX_MEMORY_MIB).contains(&memory_mib) {
        return Err(CapsuleError::Validation(format!(
            "memory_mib must be between {} and {}, got {}",
            MIN_MEMORY_MIB, MAX_MEMORY_MIB, memory_mib
        )));
    }
    Ok(())
}

/// Loads templates from `<home>/templates`, falling back to built-ins.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Load a template by name.
    ///
    /// # Errors
    ///
    /// - `Validation` if the name is malformed or matches nothing
    /// - `Config` if the user template file cannot be parsed
    pub fn resolve(&self, name: &str) -> CapsuleResult<Template> {
        validate_name("template", name)?;

        let path = self.dir.join(format!("{}.toml", name));
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                tracing::debug!(template = name, path = %path.display(), "Using user template");
                return toml::from_str(&raw).map_err(|e| {
                    CapsuleError::Config(format!("Invalid template {}: {}", path.display(), e))
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Template::builtin(name)
            .ok_or_else(|| CapsuleError::Validation(format!("unknown template '{}'", name)))
    }

    /// Built-in and user template names, sorted and deduplicated.
    pub fn names(&self) -> CapsuleResult<Vec<String>> {
        let mut names = vec![LINUX_DEFAULT.to_string(), WINDOWS_DEFAULT.to_string()];
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) == Some("toml")
                        && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                    {
                        names.push(stem.to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
