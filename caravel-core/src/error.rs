//! Error types for the `caravel-core` crate.

/// Errors produced while validating a [`crate::VmConfig`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The CPU count must be at least 1.
    #[error("invalid CPU count {0}: must be at least 1")]
    InvalidCpuCount(u32),

    /// The memory size must be at least 1 MiB.
    #[error("invalid memory size {0} MiB: must be at least 1")]
    InvalidMemorySize(u32),

    /// A disk entry has an empty path.
    #[error("disk {index} has an empty path")]
    EmptyDiskPath { index: usize },

    /// A NIC entry has an empty backend name.
    #[error("nic {index} has an empty backend")]
    EmptyNicBackend { index: usize },
}
