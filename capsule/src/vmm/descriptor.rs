//! Wire-level request bodies for the hypervisor control API.

use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};
use serde::Serialize;

use super::{BootSource, HotplugMethod, RateLimit, SerialConsole, VmmConfig};

const MIB: u64 = 1024 * 1024;

/// Token bucket refill period used for per-second rate limits.
const RATE_LIMIT_REFILL_MS: u64 = 1000;

/// Body of `vm.create`.
#[derive(Debug, Clone, Serialize)]
pub struct VmDescriptor {
    pub cpus: CpusConfig,
    pub memory: MemoryConfig,
    pub payload: PayloadConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<NetConfig>,
    pub serial: ConsoleConfig,
    pub console: ConsoleConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CpusConfig {
    pub boot_vcpus: u32,
    pub max_vcpus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<TopologyConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopologyConfig {
    pub threads_per_core: u8,
    pub cores_per_die: u8,
    pub dies_per_package: u8,
    pub packages: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryConfig {
    pub size: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub hugepages: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotplug_method: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PayloadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub readonly: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiter_config: Option<RateLimiterConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<TokenBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenBucket {
    pub size: u64,
    pub refill_time: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetConfig {
    pub tap: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleConfig {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockConfig {
    pub cid: u32,
    pub socket: PathBuf,
}

impl VmDescriptor {
    /// Translate a resolved VM configuration into the `vm.create` body.
    ///
    /// Disk order is fixed: root filesystem, data disks, UEFI boot disk,
    /// read-only driver media.
    pub fn build(config: &VmmConfig) -> CapsuleResult<Self> {
        if config.vcpus == 0 {
            return Err(CapsuleError::Validation("vcpus must be at least 1".into()));
        }
        if config.memory_mib == 0 {
            return Err(CapsuleError::Validation(
                "memory_mib must be at least 1".into(),
            ));
        }

        let max_vcpus = config.max_vcpus.unwrap_or(config.vcpus);
        if max_vcpus < config.vcpus {
            return Err(CapsuleError::Validation(format!(
                "max_vcpus ({}) is below boot vcpus ({})",
                max_vcpus, config.vcpus
            )));
        }
        if let Some(topology) = &config.topology
            && topology.vcpu_count() != max_vcpus
        {
            return Err(CapsuleError::Validation(format!(
                "CPU topology describes {} vcpus but max_vcpus is {}",
                topology.vcpu_count(),
                max_vcpus
            )));
        }

        let cpus = CpusConfig {
            boot_vcpus: config.vcpus,
            max_vcpus,
            topology: config.topology.map(|t| TopologyConfig {
                threads_per_core: t.threads_per_core,
                cores_per_die: t.cores_per_die,
                dies_per_package: t.dies_per_package,
                packages: t.packages,
            }),
        };

        let memory = MemoryConfig {
            size: mib_to_bytes(config.memory_mib)?,
            hugepages: config.hugepages,
            hotplug_method: config.hotplug_method.map(|m| match m {
                HotplugMethod::Acpi => "Acpi",
                HotplugMethod::VirtioMem => "VirtioMem",
            }),
        };

        let payload = match &config.boot {
            BootSource::Kernel {
                kernel,
                cmdline,
                initramfs,
            } => PayloadConfig {
                kernel: Some(kernel.clone()),
                cmdline: Some(cmdline.clone()),
                initramfs: initramfs.clone(),
                firmware: None,
            },
            BootSource::Firmware { firmware } => PayloadConfig {
                firmware: Some(firmware.clone()),
                ..Default::default()
            },
        };

        let mut disks = Vec::new();
        if let Some(rootfs) = &config.rootfs {
            disks.push(plain_disk(rootfs, false));
        }
        for disk in &config.disks {
            disks.push(DiskConfig {
                path: disk.path.clone(),
                readonly: disk.read_only,
                direct: disk.direct,
                rate_limiter_config: disk.rate_limit.as_ref().and_then(rate_limiter),
            });
        }
        if let Some(uefi_disk) = &config.uefi_disk {
            disks.push(plain_disk(uefi_disk, false));
        }
        for media in &config.driver_media {
            disks.push(plain_disk(media, true));
        }

        let net = config
            .network
            .iter()
            .map(|n| NetConfig {
                tap: n.tap.clone(),
                mac: n.mac.clone(),
            })
            .collect();

        let serial = match &config.serial {
            SerialConsole::Pty => ConsoleConfig {
                mode: "Pty",
                file: None,
            },
            SerialConsole::File(path) => ConsoleConfig {
                mode: "File",
                file: Some(path.clone()),
            },
            SerialConsole::Off => ConsoleConfig {
                mode: "Off",
                file: None,
            },
        };

        let vsock = config.guest_channel.as_ref().map(|c| VsockConfig {
            cid: c.cid,
            socket: c.socket.clone(),
        });

        Ok(Self {
            cpus,
            memory,
            payload,
            disks,
            net,
            serial,
            console: ConsoleConfig {
                mode: "Off",
                file: None,
            },
            vsock,
        })
    }
}

fn mib_to_bytes(mib: u64) -> CapsuleResult<u64> {
    mib.checked_mul(MIB).ok_or_else(|| {
        CapsuleError::Validation(format!("memory size of {} MiB is out of range", mib))
    })
}

fn plain_disk(path: &Path, readonly: bool) -> DiskConfig {
    DiskConfig {
        path: path.to_path_buf(),
        readonly,
        direct: false,
        rate_limiter_config: None,
    }
}

fn rate_limiter(limit: &RateLimit) -> Option<RateLimiterConfig> {
    if limit.bandwidth_bytes_per_sec.is_none() && limit.ops_per_sec.is_none() {
        return None;
    }
    let bucket = |size| TokenBucket {
        size,
        refill_time: RATE_LIMIT_REFILL_MS,
    };
    Some(RateLimiterConfig {
        bandwidth: limit.bandwidth_bytes_per_sec.map(bucket),
        ops: limit.ops_per_sec.map(bucket),
    })
}

/// Body of `vm.resize`. At least one field is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_vcpus: Option<u32>,
    /// Bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_ram: Option<u64>,
}

impl ResizeRequest {
    pub fn new(vcpus: Option<u32>, memory_mib: Option<u64>) -> CapsuleResult<Self> {
        if vcpus.is_none() && memory_mib.is_none() {
            return Err(CapsuleError::Validation(
                "resize requires vcpus or memory".into(),
            ));
        }
        if vcpus == Some(0) || memory_mib == Some(0) {
            return Err(CapsuleError::Validation(
                "resize values must be non-zero".into(),
            ));
        }
        Ok(Self {
            desired_vcpus: vcpus,
            desired_ram: memory_mib.map(mib_to_bytes).transpose()?,
        })
    }

    pub fn memory_mib(&self) -> Option<u64> {
        self.desired_ram.map(|b| b / MIB)
    }
}

/// Body of `vm.snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRequest {
    pub destination_url: String,
}

/// Body of `vm.restore`.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreRequest {
    pub source_url: String,
}

/// `file://` URL for an absolute local path.
pub fn file_url(path: &Path) -> CapsuleResult<String> {
    url::Url::from_file_path(path)
        .map(|u| u.to_string())
        .map_err(|_| {
            CapsuleError::Validation(format!(
                "snapshot path must be absolute: {}",
                path.display()
            ))
        })
}
