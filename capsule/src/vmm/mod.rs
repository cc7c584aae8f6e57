//! Hypervisor protocol client.
//!
//! ## Architecture
//!
//! - **VmmConfig**: resources and boot source for one VM
//! - **descriptor**: translation of `VmmConfig` into the hypervisor's wire format
//! - **api**: HTTP/1.1 over the hypervisor's Unix control socket
//! - **controller**: subprocess supervision and the `VmmController` seam

pub(crate) mod api;
pub mod controller;
pub mod descriptor;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::OsKind;

pub use descriptor::{ResizeRequest, VmDescriptor};

/// Optional explicit CPU topology. The product of all four fields must equal
/// the maximum vCPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub threads_per_core: u8,
    pub cores_per_die: u8,
    pub dies_per_package: u8,
    pub packages: u8,
}

impl CpuTopology {
    pub fn vcpu_count(&self) -> u32 {
        self.threads_per_core as u32
            * self.cores_per_die as u32
            * self.dies_per_package as u32
            * self.packages as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotplugMethod {
    Acpi,
    VirtioMem,
}

/// How the guest is booted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootSource {
    /// Direct Linux kernel boot.
    Kernel {
        kernel: PathBuf,
        cmdline: String,
        #[serde(default)]
        initramfs: Option<PathBuf>,
    },
    /// UEFI firmware boot (Windows guests).
    Firmware { firmware: PathBuf },
}

/// Token-bucket limits applied to a disk, per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub bandwidth_bytes_per_sec: Option<u64>,
    #[serde(default)]
    pub ops_per_sec: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub direct: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl DiskSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
            direct: false,
            rate_limit: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Tap-backed network device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub tap: String,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Serial console routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialConsole {
    Pty,
    File(PathBuf),
    Off,
}

/// Host side of the guest agent channel (hypervisor vsock device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestChannel {
    pub cid: u32,
    pub socket: PathBuf,
}

/// Fully resolved configuration for one VM, ready for the hypervisor.
///
/// Produced by template resolution; consumed by
/// [`VmmController::start`](controller::VmmController::start) (command line)
/// and [`VmmController::create`](controller::VmmController::create) (descriptor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    pub vm_name: String,
    pub os: OsKind,
    pub vcpus: u32,
    pub max_vcpus: Option<u32>,
    pub topology: Option<CpuTopology>,
    pub memory_mib: u64,
    pub hugepages: bool,
    pub hotplug_method: Option<HotplugMethod>,
    pub boot: BootSource,
    /// Root filesystem, always the first disk.
    pub rootfs: Option<PathBuf>,
    pub disks: Vec<DiskSpec>,
    /// Boot disk for UEFI guests, placed after data disks.
    pub uefi_disk: Option<PathBuf>,
    /// Read-only driver media (e.g. virtio driver ISOs), placed last.
    pub driver_media: Vec<PathBuf>,
    pub network: Option<NetworkSpec>,
    pub serial: SerialConsole,
    pub api_socket: PathBuf,
    pub guest_channel: Option<GuestChannel>,
}
