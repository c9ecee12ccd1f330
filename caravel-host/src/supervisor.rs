//! Hypervisor child-process supervision.
//!
//! Renders a [`VmConfig`] into the hypervisor argument vector, launches the
//! child, waits for its control socket to come up, and tears it down again.
//! The child's stdout and stderr are always redirected to a log file or the
//! null device: the hypervisor is chatty, and an unread in-process pipe
//! fills to the OS buffer limit and stalls the writer.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use caravel_core::VmConfig;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::HostError;

/// Environment variable selecting log-file output for the child.
/// Truthy values (`true`, `yes`, `1`; trimmed, case-insensitive) redirect
/// stdout/stderr to a fresh file under the temp directory; anything else,
/// including unset, selects the null device.
const LOG_FILES_ENV: &str = "ENABLE_QEMU_PROCESS_LOG_FILES";

/// Filesystem polls while waiting for the control socket.
const SOCKET_POLL_ATTEMPTS: u32 = 20;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pad between the socket file appearing and the child's `listen()`
/// completing; the two are not observable as a single event from outside
/// the process. The monitor client independently retries refused connects.
const SOCKET_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Grace period between SIGTERM and SIGKILL during teardown.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervisor for one hypervisor child process.
///
/// Owns the child for its whole lifetime. The child is spawned with
/// kill-on-drop, so even an abandoned supervisor cannot leak a guest.
#[derive(Debug)]
pub struct ProcessSupervisor {
    binary_path: PathBuf,
    socket_path: Option<PathBuf>,
    child: Option<Child>,
    started_at: Option<DateTime<Utc>>,
}

impl ProcessSupervisor {
    /// Create a supervisor using the default hypervisor binary
    /// (`qemu-system-x86_64` resolved via `$PATH`).
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary("qemu-system-x86_64")
    }

    /// Create a supervisor for a specific hypervisor binary.
    #[must_use]
    pub fn with_binary(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            socket_path: None,
            child: None,
            started_at: None,
        }
    }

    /// Pin the control-socket path instead of synthesizing one per launch.
    #[must_use]
    pub fn with_socket_path(mut self, socket_path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(socket_path.into());
        self
    }

    /// Launch the hypervisor and wait for its control socket.
    ///
    /// Any stale file at the socket path is unlinked first. After the spawn,
    /// the socket path is polled for up to 10 seconds; when it appears, a
    /// short settle delay covers the window between file creation and the
    /// child's `listen()`. Returns the control-socket path on success.
    ///
    /// # Errors
    /// [`HostError::ProcessAlreadyRunning`] when a live child is owned,
    /// [`HostError::Io`] if the spawn itself fails, and
    /// [`HostError::SocketCreationFailed`] when the socket never appears;
    /// in that case the child has already been terminated.
    pub async fn start(&mut self, config: &VmConfig) -> Result<PathBuf, HostError> {
        if self.is_running() {
            return Err(HostError::ProcessAlreadyRunning);
        }

        let socket_path = self
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path);
        remove_stale(&socket_path)?;

        let args = Self::build_arguments(config, &socket_path);
        let (stdout, stderr) = output_sink()?;

        tracing::info!(
            binary = %self.binary_path.display(),
            socket = %socket_path.display(),
            "spawning hypervisor"
        );
        let child = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;

        self.child = Some(child);
        self.socket_path = Some(socket_path.clone());
        self.started_at = Some(Utc::now());

        for _ in 0..SOCKET_POLL_ATTEMPTS {
            if socket_path.exists() {
                tokio::time::sleep(SOCKET_SETTLE_DELAY).await;
                return Ok(socket_path);
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        tracing::warn!(
            socket = %socket_path.display(),
            "control socket never appeared, terminating hypervisor"
        );
        self.stop().await;
        Err(HostError::SocketCreationFailed { path: socket_path })
    }

    /// Terminate the child and unlink the control socket.
    ///
    /// SIGTERM first; if the child has not exited within the grace period it
    /// is killed. Socket unlink failures other than not-found are logged and
    /// ignored. No-op when nothing is running.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                let uptime = self
                    .started_at
                    .map(|t| (Utc::now() - t).num_seconds())
                    .unwrap_or_default();
                tracing::info!(pid, uptime_secs = uptime, "stopping hypervisor");

                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                let waited = tokio::time::timeout(STOP_GRACE, child.wait()).await;
                match waited {
                    Ok(Ok(status)) => {
                        tracing::debug!(%status, "hypervisor exited after SIGTERM");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "wait after SIGTERM failed");
                    }
                    Err(_) => {
                        tracing::warn!(pid, "hypervisor ignored SIGTERM, killing");
                        let _ = child.kill().await;
                    }
                }
            }
        }

        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!(socket = %path.display(), error = %e, "socket unlink failed");
                }
            }
        }
    }

    /// Suspend until the child exits, returning its exit status.
    ///
    /// # Errors
    /// [`HostError::ProcessNotRunning`] when no child is owned;
    /// [`HostError::Io`] if the wait itself fails.
    pub async fn wait_until_exit(&mut self) -> Result<std::process::ExitStatus, HostError> {
        let child = self.child.as_mut().ok_or(HostError::ProcessNotRunning)?;
        let status = child.wait().await?;
        Ok(status)
    }

    /// Whether the OS still considers the child alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The control-socket path computed by the last [`ProcessSupervisor::start`].
    #[must_use]
    pub fn control_socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// When the current child was launched.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Render the hypervisor argument vector for a configuration.
    ///
    /// Order is significant: machine and CPU topology first, then disks and
    /// NICs in list order, direct-kernel-boot options, display, the control
    /// socket, the start-paused flag, and finally the caller's extra
    /// arguments verbatim.
    #[must_use]
    pub fn build_arguments(config: &VmConfig, socket_path: &Path) -> Vec<String> {
        let mut args = vec!["-machine".to_owned(), config.machine_type.clone()];
        if config.enable_kvm {
            args.push("-enable-kvm".to_owned());
        }
        args.push("-cpu".to_owned());
        args.push(config.cpu_type.clone());
        args.push("-smp".to_owned());
        args.push(config.cpu_count.to_string());
        args.push("-m".to_owned());
        args.push(config.memory_mib.to_string());

        for (index, disk) in config.disks.iter().enumerate() {
            let mut drive = format!(
                "file={},format={},if={},id={}",
                disk.path.display(),
                disk.format,
                disk.interface,
                disk.effective_id(index)
            );
            if disk.read_only {
                drive.push_str(",readonly=on");
            }
            args.push("-drive".to_owned());
            args.push(drive);
        }

        for (index, nic) in config.nics.iter().enumerate() {
            let id = nic.effective_id(index);
            let mut netdev = format!("{},id={id}", nic.backend);
            for option in &nic.options {
                netdev.push(',');
                netdev.push_str(option);
            }
            args.push("-netdev".to_owned());
            args.push(netdev);

            let mut device = format!("{},netdev={id}", nic.model);
            if let Some(mac) = &nic.mac {
                device.push_str(",mac=");
                device.push_str(mac);
            }
            args.push("-device".to_owned());
            args.push(device);
        }

        if let Some(kernel) = &config.kernel_path {
            args.push("-kernel".to_owned());
            args.push(kernel.display().to_string());
        }
        if let Some(initrd) = &config.initrd_path {
            args.push("-initrd".to_owned());
            args.push(initrd.display().to_string());
        }
        if let Some(cmdline) = &config.kernel_cmdline {
            args.push("-append".to_owned());
            args.push(cmdline.clone());
        }
        if config.no_graphic {
            args.push("-nographic".to_owned());
        }

        args.push("-qmp".to_owned());
        args.push(format!("unix:{},server,wait=off", socket_path.display()));

        if config.start_paused {
            args.push("-S".to_owned());
        }

        args.extend(config.extra_args.iter().cloned());
        args
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("caravel-{}.sock", Uuid::new_v4()))
}

fn remove_stale(path: &Path) -> Result<(), HostError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whether the log-file env-var value selects file output.
fn log_files_enabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1"
        )
    })
}

/// Pick the child's stdout/stderr sinks: a fresh temp log file when enabled,
/// the null device otherwise. Never a pipe.
fn output_sink() -> Result<(Stdio, Stdio), HostError> {
    if log_files_enabled(std::env::var(LOG_FILES_ENV).ok().as_deref()) {
        let path = std::env::temp_dir().join(format!("caravel-qemu-{}.log", Uuid::new_v4()));
        let file = std::fs::File::create(&path)?;
        let stderr_file = file.try_clone()?;
        tracing::info!(log = %path.display(), "hypervisor output redirected to log file");
        Ok((Stdio::from(file), Stdio::from(stderr_file)))
    } else {
        Ok((Stdio::null(), Stdio::null()))
    }
}

#[cfg(test)]
mod tests {
    use caravel_core::{DiskSpec, NicSpec};

    use super::*;

    fn full_config() -> VmConfig {
        let mut config = VmConfig::new("q35", "host");
        config.cpu_count = 4;
        config.memory_mib = 2048;
        config.enable_kvm = true;
        config.disks.push(DiskSpec::new("/var/lib/vm/root.qcow2"));
        let mut data = DiskSpec::new("/var/lib/vm/data.qcow2");
        data.read_only = true;
        data.id = Some("data".to_owned());
        config.disks.push(data);
        let mut nic = NicSpec::new("user", "virtio-net-pci");
        nic.mac = Some("52:54:00:12:34:56".to_owned());
        nic.options.push("hostfwd=tcp::2222-:22".to_owned());
        config.nics.push(nic);
        config.kernel_path = Some(PathBuf::from("/boot/vmlinuz"));
        config.kernel_cmdline = Some("console=ttyS0".to_owned());
        config.no_graphic = true;
        config.start_paused = true;
        config.extra_args.push("-snapshot".to_owned());
        config
    }

    #[test]
    fn arguments_contain_qmp_triple_exactly_once() {
        let socket = PathBuf::from("/tmp/vm.sock");
        let args = ProcessSupervisor::build_arguments(&full_config(), &socket);

        let qmp_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-qmp")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(qmp_positions.len(), 1, "-qmp must appear exactly once");
        assert_eq!(
            args[qmp_positions[0] + 1],
            "unix:/tmp/vm.sock,server,wait=off"
        );
    }

    #[test]
    fn arguments_follow_canonical_order() {
        let socket = PathBuf::from("/tmp/vm.sock");
        let args = ProcessSupervisor::build_arguments(&full_config(), &socket);

        assert_eq!(args[0], "-machine");
        assert_eq!(args[1], "q35");
        assert_eq!(args[2], "-enable-kvm");
        assert_eq!(args[3], "-cpu");
        assert_eq!(args[4], "host");
        assert_eq!(args[5], "-smp");
        assert_eq!(args[6], "4");
        assert_eq!(args[7], "-m");
        assert_eq!(args[8], "2048");

        // Extra arguments land verbatim at the tail.
        assert_eq!(args.last().map(String::as_str), Some("-snapshot"));
        // -S precedes the extra arguments.
        let s_pos = args.iter().position(|a| a == "-S");
        let qmp_pos = args.iter().position(|a| a == "-qmp");
        assert!(s_pos > qmp_pos, "-S must follow the control-socket flag");
    }

    #[test]
    fn drive_arguments_render_in_list_order_with_ids() {
        let socket = PathBuf::from("/tmp/vm.sock");
        let args = ProcessSupervisor::build_arguments(&full_config(), &socket);

        let drives: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-drive")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(drives.len(), 2);
        assert_eq!(
            drives[0],
            "file=/var/lib/vm/root.qcow2,format=qcow2,if=virtio,id=drive0"
        );
        assert_eq!(
            drives[1],
            "file=/var/lib/vm/data.qcow2,format=qcow2,if=virtio,id=data,readonly=on"
        );
    }

    #[test]
    fn nic_renders_netdev_device_pair() {
        let socket = PathBuf::from("/tmp/vm.sock");
        let args = ProcessSupervisor::build_arguments(&full_config(), &socket);

        let netdev_pos = args
            .iter()
            .position(|a| a == "-netdev")
            .expect("netdev flag present");
        assert_eq!(args[netdev_pos + 1], "user,id=net0,hostfwd=tcp::2222-:22");
        assert_eq!(args[netdev_pos + 2], "-device");
        assert_eq!(
            args[netdev_pos + 3],
            "virtio-net-pci,netdev=net0,mac=52:54:00:12:34:56"
        );
    }

    #[test]
    fn minimal_config_omits_optional_flags() {
        let socket = PathBuf::from("/tmp/vm.sock");
        let args = ProcessSupervisor::build_arguments(&VmConfig::new("virt", "max"), &socket);

        assert!(!args.contains(&"-enable-kvm".to_owned()));
        assert!(!args.contains(&"-kernel".to_owned()));
        assert!(!args.contains(&"-nographic".to_owned()));
        assert!(!args.contains(&"-S".to_owned()));
        assert!(args.contains(&"-qmp".to_owned()));
    }

    #[test]
    fn log_env_accepts_common_truthy_forms() {
        assert!(log_files_enabled(Some("true")));
        assert!(log_files_enabled(Some("TRUE")));
        assert!(log_files_enabled(Some("Yes")));
        assert!(log_files_enabled(Some(" 1 ")));

        assert!(!log_files_enabled(Some("0")));
        assert!(!log_files_enabled(Some("false")));
        assert!(!log_files_enabled(Some("on")));
        assert!(!log_files_enabled(Some("")));
        assert!(!log_files_enabled(None));
    }

    #[test]
    fn synthesized_socket_paths_are_unique() {
        let a = default_socket_path();
        let b = default_socket_path();
        assert_ne!(a, b);
        assert!(a.starts_with(std::env::temp_dir()));
    }

    #[tokio::test]
    async fn start_with_missing_binary_fails_with_io() {
        let mut supervisor = ProcessSupervisor::with_binary("/nonexistent/hypervisor");
        let result = supervisor.start(&VmConfig::new("q35", "host")).await;
        assert!(matches!(result, Err(HostError::Io(_))));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn stop_without_child_is_a_noop() {
        let mut supervisor = ProcessSupervisor::new();
        supervisor.stop().await;
        supervisor.stop().await;
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn wait_until_exit_without_child_fails() {
        let mut supervisor = ProcessSupervisor::new();
        assert!(matches!(
            supervisor.wait_until_exit().await,
            Err(HostError::ProcessNotRunning)
        ));
    }
}
