//! Host-side controller for QEMU virtual machines.
//!
//! Three pieces compose into the public facade:
//!
//! - [`MonitorClient`] speaks the hypervisor's line-delimited JSON control
//!   protocol over a UNIX or TCP socket: handshake, request/response RPC,
//!   and asynchronous event consumption.
//! - [`ProcessSupervisor`] launches and terminates the hypervisor child
//!   process, renders the argument vector from a [`VmConfig`], and waits for
//!   the control socket to come up.
//! - [`VmManager`] owns one of each and drives the VM state machine with
//!   bounded timeouts and rollback on partial failure.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod supervisor;

pub use caravel_core::{ConfigError, DiskSpec, NicSpec, VmConfig, VmStatus};
pub use error::HostError;
pub use manager::VmManager;
pub use monitor::MonitorClient;
pub use protocol::{MonitorEvent, MonitorRequest, MonitorResponse, QueryStatus};
pub use supervisor::ProcessSupervisor;
