//! Fuzz target: hypervisor argument rendering.
//!
//! Builds a configuration from arbitrary strings and renders it. The
//! builder must never panic, and the control-socket flag it synthesizes
//! must always be present.
#![no_main]

use std::path::Path;

use caravel_core::{DiskSpec, NicSpec, VmConfig};
use caravel_host::ProcessSupervisor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let mut parts = text.split('\u{1f}');

    let mut config = VmConfig::new(
        parts.next().unwrap_or_default(),
        parts.next().unwrap_or_default(),
    );
    if let Some(disk_path) = parts.next() {
        let mut disk = DiskSpec::new(disk_path);
        disk.format = parts.next().unwrap_or("qcow2").to_owned();
        disk.read_only = true;
        config.disks.push(disk);
    }
    if let Some(backend) = parts.next() {
        let mut nic = NicSpec::new(backend, parts.next().unwrap_or("virtio-net-pci"));
        nic.mac = parts.next().map(str::to_owned);
        config.nics.push(nic);
    }
    config.kernel_cmdline = parts.next().map(str::to_owned);
    config.extra_args.extend(parts.map(str::to_owned));

    let args = ProcessSupervisor::build_arguments(&config, Path::new("/tmp/fuzz.sock"));
    let socket_flag = args
        .windows(2)
        .any(|pair| pair[0] == "-qmp" && pair[1] == "unix:/tmp/fuzz.sock,server,wait=off");
    assert!(socket_flag);
});
