//! VM lifecycle coordination.
//!
//! [`VmManager`] composes one [`ProcessSupervisor`] and one
//! [`MonitorClient`] behind a single mutex held for the duration of each
//! public method, so process state, connection state, and the tracked
//! [`VmStatus`] can never be observed or mutated concurrently.

use std::path::Path;
use std::time::Duration;

use caravel_core::{VmConfig, VmStatus};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::HostError;
use crate::monitor::MonitorClient;
use crate::supervisor::ProcessSupervisor;

/// Budget for launching the hypervisor and completing the handshake.
const CREATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for a guest to power down before teardown is forced.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Frontend driver bound to hot-plugged disks.
const HOTPLUG_DISK_DRIVER: &str = "virtio-blk-pci";

struct ManagerInner {
    status: VmStatus,
    connected: bool,
    supervisor: ProcessSupervisor,
    monitor: MonitorClient,
}

/// Coordinator for a single VM.
///
/// Drives the lifecycle state machine: `create_vm` launches the hypervisor
/// and connects the monitor, the lifecycle methods steer the guest through
/// run-state transitions, and `destroy` tears everything down from any
/// state. Operations that launch or shut down are bounded by timeouts and
/// roll back on partial failure.
pub struct VmManager {
    inner: Mutex<ManagerInner>,
}

impl VmManager {
    /// Create a manager with a default supervisor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_supervisor(ProcessSupervisor::new())
    }

    /// Create a manager around a preconfigured supervisor (custom binary or
    /// pinned control-socket path).
    #[must_use]
    pub fn with_supervisor(supervisor: ProcessSupervisor) -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                status: VmStatus::Stopped,
                connected: false,
                supervisor,
                monitor: MonitorClient::new(),
            }),
        }
    }

    /// The currently tracked VM status.
    pub async fn status(&self) -> VmStatus {
        self.inner.lock().await.status
    }

    /// Whether the monitor connection is live.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    /// Whether the OS still considers the hypervisor child alive.
    pub async fn process_running(&self) -> bool {
        self.inner.lock().await.supervisor.is_running()
    }

    /// Launch a VM with the default creation budget.
    ///
    /// # Errors
    /// See [`VmManager::create_vm_with_timeout`].
    pub async fn create_vm(&self, config: &VmConfig) -> Result<(), HostError> {
        self.create_vm_with_timeout(config, CREATE_TIMEOUT).await
    }

    /// Launch a VM: validate, spawn the hypervisor, connect the monitor.
    ///
    /// The launch sequence races against `timeout`; whichever side finishes
    /// first cancels the other. Every failure path (validation, spawn,
    /// socket readiness, handshake, timeout) leaves the manager stopped,
    /// disconnected, and with the child terminated.
    ///
    /// # Errors
    /// [`HostError::Config`] for an invalid configuration,
    /// [`HostError::Timeout`] when the budget is exceeded, or whatever the
    /// supervisor and monitor surfaced.
    pub async fn create_vm_with_timeout(
        &self,
        config: &VmConfig,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        config.validate()?;
        inner.status = VmStatus::Creating;

        let inner_ref = &mut *inner;
        let setup = async {
            let socket_path = inner_ref.supervisor.start(config).await?;
            inner_ref.monitor.connect_unix(&socket_path).await
        };
        let outcome = tokio::time::timeout(timeout, setup).await;
        match outcome {
            Ok(Ok(())) => {
                inner.connected = true;
                if let Err(e) = inner.refresh_status().await {
                    tracing::warn!(error = %e, "status refresh after creation failed");
                }
                tracing::info!(status = %inner.status, "VM created");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "VM creation failed, rolling back");
                inner.teardown().await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "VM creation timed out, rolling back"
                );
                inner.teardown().await;
                Err(HostError::Timeout(timeout))
            }
        }
    }

    /// Resume guest execution.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor, or the monitor
    /// failure; the tracked status is left unchanged on failure.
    pub async fn start(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        let previous = inner.status;
        inner.status = VmStatus::Running;
        let result = inner.monitor.cont().await;
        if let Err(e) = result {
            inner.status = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Pause guest execution.
    ///
    /// # Errors
    /// Same contract as [`VmManager::start`].
    pub async fn pause(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        let previous = inner.status;
        inner.status = VmStatus::Paused;
        let result = inner.monitor.stop().await;
        if let Err(e) = result {
            inner.status = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Hard-reset the guest, then refresh the tracked status from the
    /// monitor.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor; on any monitor
    /// failure the status becomes [`VmStatus::Unknown`].
    pub async fn reset(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        let result = inner.monitor.system_reset().await;
        if let Err(e) = result {
            inner.status = VmStatus::Unknown;
            return Err(e);
        }
        inner.refresh_status().await.map(drop)
    }

    /// Gracefully power down the guest, escalating to [`VmManager::destroy`]
    /// semantics if it does not exit in time.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor, or the powerdown
    /// request failure. The manager ends stopped either way.
    pub async fn shutdown(&self) -> Result<(), HostError> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.status = VmStatus::ShuttingDown;

        let powerdown = inner.monitor.system_powerdown().await;
        if let Err(e) = powerdown {
            tracing::warn!(error = %e, "powerdown request failed, forcing teardown");
            inner.destroy().await;
            return Err(e);
        }

        let waited =
            tokio::time::timeout(SHUTDOWN_TIMEOUT, inner.supervisor.wait_until_exit()).await;
        match waited {
            Ok(Ok(status)) => {
                tracing::info!(%status, "guest powered down");
                inner.monitor.disconnect().await;
                inner.supervisor.stop().await;
                inner.connected = false;
                inner.status = VmStatus::Stopped;
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wait for guest exit failed, forcing teardown");
                inner.destroy().await;
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "guest did not power down in time, forcing teardown"
                );
                inner.destroy().await;
                Ok(())
            }
        }
    }

    /// Tear the VM down unconditionally: best-effort `quit`, monitor
    /// disconnect, process termination. Callable from any state, including
    /// mid-creation cleanup; always leaves the manager stopped and
    /// disconnected.
    pub async fn destroy(&self) {
        let mut inner = self.inner.lock().await;
        inner.destroy().await;
    }

    /// Refresh the tracked status from the monitor.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor. A monitor failure
    /// is propagated and sets the status to [`VmStatus::Unknown`], not
    /// `Stopped`: the process may still be live.
    pub async fn update_status(&self) -> Result<VmStatus, HostError> {
        let mut inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.refresh_status().await
    }

    /// Hot-plug a disk into the running guest.
    ///
    /// Two steps: a `blockdev-add` creates the backend node
    /// `drive-{device_name}`, then a `device_add` binds a virtio-blk
    /// frontend to it. If the second step fails, the backend node is deleted
    /// again (best effort) and the `device_add` error is surfaced.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor, or the failing
    /// step's monitor error.
    pub async fn attach_disk(
        &self,
        path: &Path,
        device_name: &str,
        read_only: bool,
    ) -> Result<(), HostError> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;

        let node_name = format!("drive-{device_name}");
        inner
            .monitor
            .blockdev_add(&node_name, path, read_only)
            .await?;

        if let Err(e) = inner
            .monitor
            .device_add(HOTPLUG_DISK_DRIVER, device_name, &node_name)
            .await
        {
            tracing::warn!(
                device = device_name,
                error = %e,
                "frontend attach failed, removing backend node"
            );
            if let Err(rollback) = inner.monitor.blockdev_del(&node_name).await {
                tracing::warn!(
                    node = %node_name,
                    error = %rollback,
                    "backend rollback failed"
                );
            }
            return Err(e);
        }

        tracing::info!(device = device_name, disk = %path.display(), "disk attached");
        Ok(())
    }

    /// Hot-unplug a disk: `device_del` for the frontend, then
    /// `blockdev-del` for the backend node. Detach is idempotent at the
    /// hypervisor level, so there is no rollback.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor, or the failing
    /// step's monitor error.
    pub async fn detach_disk(&self, device_name: &str) -> Result<(), HostError> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;

        inner.monitor.device_del(device_name).await?;
        inner
            .monitor
            .blockdev_del(&format!("drive-{device_name}"))
            .await?;

        tracing::info!(device = device_name, "disk detached");
        Ok(())
    }

    /// Return the hypervisor's raw block-device table.
    ///
    /// # Errors
    /// [`HostError::NotConnected`] without a live monitor, or the monitor
    /// failure.
    pub async fn list_disks(&self) -> Result<Vec<Value>, HostError> {
        let inner = self.inner.lock().await;
        inner.require_connected()?;
        inner.monitor.query_block().await
    }
}

impl Default for VmManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerInner {
    fn require_connected(&self) -> Result<(), HostError> {
        if self.connected {
            Ok(())
        } else {
            Err(HostError::NotConnected)
        }
    }

    async fn refresh_status(&mut self) -> Result<VmStatus, HostError> {
        match self.monitor.query_status().await {
            Ok(reply) => {
                let status = VmStatus::from_monitor(&reply.status, reply.running);
                if status == VmStatus::Unknown {
                    tracing::warn!(status = %reply.status, "unrecognized monitor status");
                }
                self.status = status;
                Ok(status)
            }
            Err(e) => {
                self.status = VmStatus::Unknown;
                Err(e)
            }
        }
    }

    /// Full teardown with a best-effort `quit` first. The child may already
    /// be exiting, so a failed `quit` is logged and ignored.
    async fn destroy(&mut self) {
        if self.connected {
            if let Err(e) = self.monitor.quit().await {
                tracing::debug!(error = %e, "quit request failed, terminating directly");
            }
        }
        self.teardown().await;
    }

    /// Disconnect the monitor, terminate the child, and settle into the
    /// stopped state.
    async fn teardown(&mut self) {
        self.monitor.disconnect().await;
        self.supervisor.stop().await;
        self.connected = false;
        self.status = VmStatus::Stopped;
    }
}
