//! Error types for the host controller crate.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while supervising a VM or talking to its monitor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HostError {
    /// A monitor operation was attempted without a live connection.
    #[error("not connected to the hypervisor monitor")]
    NotConnected,

    /// The monitor transport failed during or after the handshake.
    #[error("monitor connection lost")]
    ConnectionLost,

    /// A monitor reply was well-formed JSON but missing required structure.
    #[error("invalid monitor response: {0}")]
    InvalidResponse(String),

    /// The monitor returned an error reply; both strings are passed through
    /// verbatim from the peer.
    #[error("monitor error [{class}]: {desc}")]
    Monitor { class: String, desc: String },

    /// An operation required a live hypervisor child.
    #[error("hypervisor process is not running")]
    ProcessNotRunning,

    /// A second child launch was attempted while one is still owned.
    #[error("hypervisor process is already running")]
    ProcessAlreadyRunning,

    /// The control socket did not appear within the readiness budget.
    #[error("control socket {} did not appear in time", .path.display())]
    SocketCreationFailed { path: PathBuf },

    /// A bounded operation exceeded its budget.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The VM configuration failed validation.
    #[error(transparent)]
    Config(#[from] caravel_core::ConfigError),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
