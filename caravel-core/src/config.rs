//! Declarative VM configuration.
//!
//! A [`VmConfig`] describes everything the hypervisor needs to boot a guest:
//! machine and CPU model, memory, an ordered set of disks and NICs, and
//! optional direct-kernel-boot parameters. The configuration is a plain
//! value object; it is rendered into a hypervisor argument vector by the
//! process supervisor and never mutated after submission.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for launching a new VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct VmConfig {
    /// Machine type (e.g. "q35", "virt").
    pub machine_type: String,

    /// CPU model (e.g. "host", "max").
    pub cpu_type: String,

    /// Number of virtual CPUs. Must be at least 1.
    pub cpu_count: u32,

    /// Memory size in mebibytes. Must be at least 1.
    pub memory_mib: u32,

    /// Enable KVM acceleration.
    pub enable_kvm: bool,

    /// Disks, rendered in list order.
    pub disks: Vec<DiskSpec>,

    /// Network interfaces, rendered in list order.
    pub nics: Vec<NicSpec>,

    /// Kernel image for direct kernel boot.
    pub kernel_path: Option<PathBuf>,

    /// Initial ramdisk for direct kernel boot.
    pub initrd_path: Option<PathBuf>,

    /// Kernel command line for direct kernel boot.
    pub kernel_cmdline: Option<String>,

    /// Disable graphical output.
    pub no_graphic: bool,

    /// Start the guest with vCPUs paused.
    pub start_paused: bool,

    /// Extra arguments appended verbatim to the hypervisor command line.
    pub extra_args: Vec<String>,
}

impl VmConfig {
    /// Create a minimal configuration with the given machine and CPU types.
    ///
    /// Defaults: 1 vCPU, 512 MiB of memory, no KVM, no devices.
    #[must_use]
    pub fn new(machine_type: impl Into<String>, cpu_type: impl Into<String>) -> Self {
        Self {
            machine_type: machine_type.into(),
            cpu_type: cpu_type.into(),
            cpu_count: 1,
            memory_mib: 512,
            enable_kvm: false,
            disks: Vec::new(),
            nics: Vec::new(),
            kernel_path: None,
            initrd_path: None,
            kernel_cmdline: None,
            no_graphic: false,
            start_paused: false,
            extra_args: Vec::new(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the CPU count or memory size is zero, or
    /// if any disk or NIC entry is structurally incomplete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 {
            return Err(ConfigError::InvalidCpuCount(self.cpu_count));
        }
        if self.memory_mib == 0 {
            return Err(ConfigError::InvalidMemorySize(self.memory_mib));
        }
        for (index, disk) in self.disks.iter().enumerate() {
            if disk.path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyDiskPath { index });
            }
        }
        for (index, nic) in self.nics.iter().enumerate() {
            if nic.backend.is_empty() {
                return Err(ConfigError::EmptyNicBackend { index });
            }
        }
        Ok(())
    }
}

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DiskSpec {
    /// Path to the disk image on the host.
    pub path: PathBuf,

    /// Image format (default "qcow2").
    pub format: String,

    /// Device interface (default "virtio").
    pub interface: String,

    /// Attach the disk read-only.
    pub read_only: bool,

    /// Stable drive id. When absent, one is synthesized from the disk's
    /// position in the list.
    pub id: Option<String>,
}

impl DiskSpec {
    /// Create a disk spec with default format and interface.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: "qcow2".to_owned(),
            interface: "virtio".to_owned(),
            read_only: false,
            id: None,
        }
    }

    /// The drive id used on the command line: the explicit id when set,
    /// otherwise `drive{index}`.
    #[must_use]
    pub fn effective_id(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("drive{index}"))
    }
}

/// A network interface attached to the guest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct NicSpec {
    /// Host backend (e.g. "user", "tap", "bridge").
    pub backend: String,

    /// Guest-visible device model (e.g. "virtio-net-pci").
    pub model: String,

    /// MAC address, when pinned.
    pub mac: Option<String>,

    /// Stable netdev id. When absent, one is synthesized from the NIC's
    /// position in the list.
    pub id: Option<String>,

    /// Extra backend options appended to the netdev argument.
    pub options: Vec<String>,
}

impl NicSpec {
    /// Create a NIC spec for the given backend and device model.
    #[must_use]
    pub fn new(backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            mac: None,
            id: None,
            options: Vec::new(),
        }
    }

    /// The netdev id used on the command line: the explicit id when set,
    /// otherwise `net{index}`.
    #[must_use]
    pub fn effective_id(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("net{index}"))
    }
}
