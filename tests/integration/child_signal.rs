#[path = "common/mod.rs"]
mod common;

use std::{os::unix::net::UnixStream, thread, time::Duration};

use assert_cmd::Command;
use common::{assert_still_running, spawn_sentinel, wait_for_exit, wait_for_path};
use predicates::prelude::*;
use tempfile::tempdir;

fn sentinel() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("vfs-sentinel"));
    cmd.env("RUST_LOG", "info").timeout(Duration::from_secs(10));
    cmd
}

#[test]
fn exits_cleanly_when_spawned_worker_finishes() {
    sentinel()
        .args(["spawn", "--", "sh", "-c", "sleep 0.2"])
        .assert()
        .success()
        .stderr(predicate::str::contains("exited with code 0"));
}

#[test]
fn worker_exit_code_is_reported_not_propagated() {
    sentinel()
        .args(["spawn", "--", "sh", "-c", "exit 3"])
        .assert()
        .success()
        .stderr(predicate::str::contains("exited with code 3"));
}

#[test]
fn killed_worker_is_reported_with_its_signal() {
    sentinel()
        .args(["spawn", "--", "sh", "-c", "kill -9 $$"])
        .assert()
        .success()
        .stderr(predicate::str::contains("killed by signal 9"));
}

#[test]
fn missing_worker_binary_fails_setup() {
    sentinel()
        .args(["spawn", "--", "/nonexistent/vfs-worker"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Setup failed"));
}

#[test]
fn spawned_worker_coexists_with_handshake_socket() {
    let temp = tempdir().expect("failed to create tempdir");
    let socket = temp.path().join("ctrl.sock");
    let socket_arg = socket.to_str().expect("utf-8 temp path");

    let mut child = spawn_sentinel([
        "spawn",
        "--socket-path",
        socket_arg,
        "--",
        "sh",
        "-c",
        "sleep 1",
    ]);
    wait_for_path(&socket);
    let client = UnixStream::connect(&socket).expect("handshake failed");
    assert_still_running(&mut child);
    drop(client);

    let output = wait_for_exit(child);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(stderr.contains("exited with code 0"), "exit not observed:\n{stderr}");
    assert!(!socket.exists(), "handshake socket left behind");
}

#[test]
fn worker_is_not_started_when_socket_cannot_be_bound() {
    let temp = tempdir().expect("failed to create tempdir");
    let socket = temp.path().join("missing-dir/ctrl.sock");
    let marker = temp.path().join("worker-ran");
    let script = format!("sleep 0.5; touch {}", marker.display());

    sentinel()
        .arg("spawn")
        .arg("--socket-path")
        .arg(&socket)
        .args(["--", "sh", "-c", script.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("handshake socket"));

    thread::sleep(Duration::from_millis(1000));
    assert!(
        !marker.exists(),
        "worker kept running after the sentinel failed setup"
    );
}
