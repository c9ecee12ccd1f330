//! Smoke tests against a real hypervisor.
//!
//! These require `qemu-system-x86_64` on `$PATH`. They boot a firmware-only
//! guest (no disk, no kernel), which is enough to exercise the monitor
//! handshake and run-state transitions.
//! Run with: `cargo test --test qemu_lifecycle -- --ignored`

use caravel_host::{VmConfig, VmManager, VmStatus};

fn qemu_config() -> VmConfig {
    let mut config = VmConfig::new("q35", "max");
    config.memory_mib = 256;
    config.no_graphic = true;
    config
}

#[tokio::test]
#[ignore = "requires qemu-system-x86_64"]
async fn create_query_pause_resume_destroy() {
    let manager = VmManager::new();
    manager.create_vm(&qemu_config()).await.expect("create failed");
    assert!(manager.is_connected().await);
    assert!(manager.process_running().await);

    let status = manager.update_status().await.expect("status query failed");
    assert!(
        matches!(status, VmStatus::Running | VmStatus::Creating),
        "fresh guest should be running or still in firmware: {status}"
    );

    manager.pause().await.expect("pause failed");
    assert_eq!(manager.status().await, VmStatus::Paused);
    let refreshed = manager.update_status().await.expect("status query failed");
    assert_eq!(refreshed, VmStatus::Paused);

    manager.start().await.expect("resume failed");
    assert_eq!(manager.status().await, VmStatus::Running);

    manager.destroy().await;
    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.process_running().await);
}

#[tokio::test]
#[ignore = "requires qemu-system-x86_64"]
async fn start_paused_guest_reports_paused() {
    let mut config = qemu_config();
    config.start_paused = true;

    let manager = VmManager::new();
    manager.create_vm(&config).await.expect("create failed");

    // With -S the vCPUs are held, so the monitor reports a non-running
    // guest straight after creation.
    assert_eq!(manager.status().await, VmStatus::Paused);

    manager.start().await.expect("releasing vCPUs failed");
    assert_eq!(manager.status().await, VmStatus::Running);

    manager.destroy().await;
}

#[tokio::test]
#[ignore = "requires qemu-system-x86_64"]
async fn shutdown_escalates_for_a_firmware_only_guest() {
    // A guest with no OS ignores ACPI powerdown, so shutdown has to wait out
    // its budget and then force teardown.
    let manager = VmManager::new();
    manager.create_vm(&qemu_config()).await.expect("create failed");

    manager.shutdown().await.expect("shutdown failed");
    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.is_connected().await);
    assert!(!manager.process_running().await);
}
