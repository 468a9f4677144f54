// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `msdctl` against a scripted daemon on a filesystem socket.

use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::{self, JoinHandle};

use assert_cmd::prelude::*;
use msd_proto::{ActiveMassStorageDevice, Request, Response, accept_version};

/// Serve one connection, answering each request with the next response.
/// Returns the names of the received requests and, for `SetMassStorage`,
/// the device flags.
fn scripted_daemon(
    socket: &Path,
    responses: Vec<Response>,
) -> JoinHandle<Vec<(&'static str, Vec<(bool, bool)>)>> {
    let listener = UnixListener::bind(socket).unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        accept_version(&mut stream).unwrap();
        let mut seen = Vec::new();
        for response in responses {
            let request = Request::read_from(&mut stream).unwrap();
            let flags = match &request {
                Request::SetMassStorage(devices) => devices.iter().map(|d| (d.cdrom, d.ro)).collect(),
                _ => Vec::new(),
            };
            seen.push((request.name(), flags));
            response.write_to(&mut stream).unwrap();
        }
        seen
    })
}

fn msdctl(socket: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("msdctl"));
    cmd.env_remove("MSDCTL_SOCKET_NAME")
        .arg("--socket-path")
        .arg(socket)
        .arg("--timeout-ms")
        .arg("5000");
    cmd
}

#[msd_test_utils::logged_test]
fn get_mass_storage_prints_json() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("msdd.sock");
    let daemon = scripted_daemon(
        &socket,
        vec![Response::GetMassStorageResult(vec![
            ActiveMassStorageDevice {
                file: PathBuf::from("/srv/install.iso"),
                cdrom: true,
                ro: true,
            },
            ActiveMassStorageDevice {
                file: PathBuf::from("/srv/disk.img"),
                cdrom: false,
                ro: false,
            },
        ])],
    );

    let output = msdctl(&socket)
        .args(["--json", "get-mass-storage"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let printed: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(
        printed,
        serde_json::json!([
            { "position": 0, "file": "/srv/install.iso", "type": "cdrom" },
            { "position": 1, "file": "/srv/disk.img", "type": "disk-rw" },
        ])
    );
    assert_eq!(daemon.join().unwrap(), vec![("GetMassStorage", vec![])]);
}

#[msd_test_utils::logged_test]
fn get_mass_storage_labels_devices_by_position() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("msdd.sock");
    // Positions count active devices only, not LUN numbers.
    let daemon = scripted_daemon(
        &socket,
        vec![Response::GetMassStorageResult(vec![ActiveMassStorageDevice {
            file: PathBuf::from("/srv/disk.img"),
            cdrom: false,
            ro: true,
        }])],
    );

    let output = msdctl(&socket)
        .arg("get-mass-storage")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    msd_test_utils::logged_assert_eq!(logger, String::from_utf8(output).unwrap(), "#0: /srv/disk.img (disk-ro)\n");
    daemon.join().unwrap();
}

#[msd_test_utils::logged_test]
fn set_mass_storage_sends_one_device_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("msdd.sock");
    let iso = dir.path().join("install.iso");
    let disk = dir.path().join("disk.img");
    std::fs::write(&iso, b"iso").unwrap();
    std::fs::write(&disk, b"disk").unwrap();
    let daemon = scripted_daemon(&socket, vec![Response::SetMassStorageAck]);

    let output = msdctl(&socket)
        .arg("set-mass-storage")
        .arg("-f")
        .arg(&iso)
        .args(["-t", "cdrom", "-f"])
        .arg(&disk)
        .args(["-t", "disk-rw"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    assert_eq!(String::from_utf8(output).unwrap(), "Exposing 2 device(s)\n");
    assert_eq!(
        daemon.join().unwrap(),
        vec![("SetMassStorage", vec![(true, true), (false, false)])]
    );
}

#[msd_test_utils::logged_test]
fn daemon_error_exits_with_status_one() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("msdd.sock");
    let daemon = scripted_daemon(
        &socket,
        vec![Response::error("Denying connection because SELinux is not enforcing")],
    );

    let assert = msdctl(&socket).arg("get-functions").assert().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("SELinux is not enforcing"), "stderr: {stderr}");
    daemon.join().unwrap();
}

#[msd_test_utils::logged_test]
fn mismatched_counts_fail_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("absent.sock");

    let assert = msdctl(&socket)
        .args(["set-mass-storage", "-f", "/srv/a.img", "-f", "/srv/b.img", "-t", "disk-ro"])
        .assert()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("pass one --type per --file"), "stderr: {stderr}");
}

#[msd_test_utils::logged_test]
fn missing_daemon_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("absent.sock");

    let assert = msdctl(&socket).arg("get-mass-storage").assert().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("Failed to connect"), "stderr: {stderr}");
}
