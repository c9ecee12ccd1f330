//! Integration tests for the VM manager against a stub hypervisor.
//!
//! The "hypervisor" is a shell script that just stays alive; the monitor
//! side is played by an in-process task that binds the control socket a
//! moment after launch (mimicking the real binary's startup lag) and serves
//! scripted replies.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use caravel_host::{HostError, ProcessSupervisor, VmConfig, VmManager, VmStatus};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

const GREETING: &[u8] =
    b"{\"QMP\":{\"version\":{\"qemu\":{\"major\":7,\"minor\":0,\"micro\":0},\"package\":\"\"},\"capabilities\":[]}}\n";

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("caravel-mgr-{tag}-{}.sock", uuid::Uuid::new_v4()))
}

/// Write an executable stub that ignores its hypervisor-style arguments and
/// stays alive until signalled.
fn stub_hypervisor() -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::temp_dir().join(format!("caravel-stub-{}.sh", uuid::Uuid::new_v4()));
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").expect("stub write failed");
    let mut permissions = std::fs::metadata(&path)
        .expect("stub metadata failed")
        .permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("stub chmod failed");
    path
}

fn test_config() -> VmConfig {
    let mut config = VmConfig::new("q35", "max");
    config.no_graphic = true;
    config
}

/// Play the monitor side: bind the control socket shortly after launch,
/// handshake, then answer every command. Commands are recorded in arrival
/// order; the first `device_add` is rejected when `fail_first_device_add`
/// is set.
async fn serve_monitor(
    path: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    fail_first_device_add: bool,
) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    let listener = UnixListener::bind(&path).expect("mock bind failed");
    let (stream, _) = listener.accept().await.expect("mock accept failed");
    let (read, mut write) = stream.into_split();
    write.write_all(GREETING).await.expect("greeting write failed");

    let mut reader = BufReader::new(read);
    let mut line = String::new();
    let mut device_add_rejected = false;
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.expect("mock read failed");
        if n == 0 {
            break;
        }
        let request: Value = serde_json::from_str(&line).expect("request was not JSON");
        let command = request["execute"]
            .as_str()
            .expect("request missing execute")
            .to_owned();
        commands.lock().expect("command log poisoned").push(command.clone());

        let reply = match command.as_str() {
            "query-status" => {
                r#"{"return":{"status":"running","singlestep":false,"running":true}}"#.to_owned()
            }
            "query-block" => {
                r#"{"return":[{"device":"drive0"},{"device":"drive-data1"}]}"#.to_owned()
            }
            "device_add" if fail_first_device_add && !device_add_rejected => {
                device_add_rejected = true;
                r#"{"error":{"class":"GenericError","desc":"Bus 'pci.0' does not support hotplugging"}}"#
                    .to_owned()
            }
            _ => r#"{"return": {}}"#.to_owned(),
        };
        write.write_all(reply.as_bytes()).await.expect("mock reply failed");
        write.write_all(b"\n").await.expect("mock reply failed");
    }
}

#[tokio::test]
async fn full_lifecycle_against_a_mock_monitor() {
    let socket = socket_path("lifecycle");
    let commands = Arc::new(Mutex::new(Vec::new()));
    let server = tokio::spawn(serve_monitor(socket.clone(), Arc::clone(&commands), true));

    let supervisor =
        ProcessSupervisor::with_binary(stub_hypervisor()).with_socket_path(&socket);
    let manager = VmManager::with_supervisor(supervisor);

    manager.create_vm(&test_config()).await.expect("create failed");
    assert!(manager.is_connected().await);
    assert!(manager.process_running().await);
    assert_eq!(manager.status().await, VmStatus::Running);

    // First attach: the frontend bind is rejected, so the freshly created
    // backend node must be rolled back before the error surfaces.
    let attach = manager
        .attach_disk(Path::new("/tmp/hot.img"), "data1", false)
        .await;
    assert!(matches!(attach, Err(HostError::Monitor { .. })));
    {
        let log = commands.lock().expect("command log poisoned");
        let tail: Vec<&str> = log.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, ["blockdev-del", "device_add", "blockdev-add"]);
    }

    manager
        .attach_disk(Path::new("/tmp/hot.img"), "data1", false)
        .await
        .expect("second attach failed");

    let disks = manager.list_disks().await.expect("list failed");
    assert_eq!(disks.len(), 2);

    manager.detach_disk("data1").await.expect("detach failed");
    {
        let log = commands.lock().expect("command log poisoned");
        let tail: Vec<&str> = log.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, ["blockdev-del", "device_del"]);
    }

    manager.pause().await.expect("pause failed");
    assert_eq!(manager.status().await, VmStatus::Paused);
    manager.start().await.expect("resume failed");
    assert_eq!(manager.status().await, VmStatus::Running);

    let refreshed = manager.update_status().await.expect("refresh failed");
    assert_eq!(refreshed, VmStatus::Running);

    manager.destroy().await;
    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.is_connected().await);
    assert!(!manager.process_running().await);
    assert!(
        commands
            .lock()
            .expect("command log poisoned")
            .contains(&"quit".to_owned()),
        "destroy must attempt a graceful quit first"
    );

    server.await.expect("mock monitor task failed");
}

#[tokio::test]
async fn create_vm_timeout_rolls_back_completely() {
    // Nobody ever binds the control socket, so creation must hit its budget.
    let socket = socket_path("timeout");
    let supervisor =
        ProcessSupervisor::with_binary(stub_hypervisor()).with_socket_path(&socket);
    let manager = VmManager::with_supervisor(supervisor);

    let started = Instant::now();
    let result = manager
        .create_vm_with_timeout(&test_config(), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(HostError::Timeout(_))));
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "rollback must not drag out: {:?}",
        started.elapsed()
    );

    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.is_connected().await);
    assert!(
        !manager.process_running().await,
        "the stub child must be terminated on rollback"
    );
}

#[tokio::test]
async fn destroy_after_failed_creation_is_idempotent() {
    let socket = socket_path("destroy-after-fail");
    let supervisor =
        ProcessSupervisor::with_binary(stub_hypervisor()).with_socket_path(&socket);
    let manager = VmManager::with_supervisor(supervisor);

    let result = manager
        .create_vm_with_timeout(&test_config(), Duration::from_secs(1))
        .await;
    assert!(result.is_err());

    manager.destroy().await;
    manager.destroy().await;
    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.is_connected().await);
}

#[tokio::test]
async fn spawn_failure_leaves_the_manager_stopped() {
    let supervisor = ProcessSupervisor::with_binary("/nonexistent/hypervisor");
    let manager = VmManager::with_supervisor(supervisor);

    let result = manager.create_vm(&test_config()).await;
    assert!(matches!(result, Err(HostError::Io(_))));
    assert_eq!(manager.status().await, VmStatus::Stopped);
    assert!(!manager.is_connected().await);
}
