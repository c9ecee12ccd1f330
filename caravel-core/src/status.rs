//! VM lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a VM as tracked by the controller.
///
/// A VM starts `Stopped`, passes through `Creating` while the hypervisor is
/// launched and the monitor handshake completes, and returns to `Stopped`
/// after teardown. `Unknown` means the guest is likely alive but the monitor
/// reported something the controller could not interpret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmStatus {
    /// No hypervisor process is running.
    #[default]
    Stopped,
    /// The hypervisor is being launched and connected.
    Creating,
    /// The guest vCPUs are executing.
    Running,
    /// The guest is suspended.
    Paused,
    /// A graceful shutdown has been requested.
    ShuttingDown,
    /// The monitor reported a state the controller does not track.
    Unknown,
}

impl VmStatus {
    /// Map a monitor `query-status` reply onto a controller state.
    ///
    /// The monitor's `status` string is authoritative except for "running",
    /// where the `running` boolean decides between [`VmStatus::Running`] and
    /// [`VmStatus::Paused`].
    #[must_use]
    pub fn from_monitor(status: &str, running: bool) -> Self {
        match status {
            "running" => {
                if running {
                    Self::Running
                } else {
                    Self::Paused
                }
            }
            "paused" | "suspended" => Self::Paused,
            "shutdown" | "poweroff" => Self::Stopped,
            "inmigrate" | "prelaunch" => Self::Creating,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::ShuttingDown => "shutting-down",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
