#[path = "common/mod.rs"]
mod common;

use std::{ffi::OsStr, fs};

use common::{assert_still_running, spawn_sentinel, spawn_worker, wait_for_exit, wait_for_path};
use tempfile::tempdir;

#[test]
fn exits_cleanly_after_discovered_worker_dies() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");
    let socket = temp.path().join("ctrl.sock");

    let mut sentinel = spawn_sentinel([
        OsStr::new("watch"),
        OsStr::new("--pidfile"),
        pidfile.as_os_str(),
        OsStr::new("--socket-path"),
        socket.as_os_str(),
    ]);
    // The socket appears only after the directory watch is armed.
    wait_for_path(&socket);
    assert_still_running(&mut sentinel);

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    // Left unreaped so the pid stays valid until the sentinel has looked at it.
    worker.kill().expect("failed to kill worker");

    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(
        stderr.contains(&format!("Monitoring worker process {}", worker.id())),
        "worker was never monitored:\n{stderr}"
    );
    assert!(!socket.exists(), "handshake socket left behind");
}

#[test]
fn empty_pidfile_is_not_mistaken_for_a_pid() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");
    let socket = temp.path().join("ctrl.sock");

    let mut sentinel = spawn_sentinel([
        OsStr::new("watch"),
        OsStr::new("--pidfile"),
        pidfile.as_os_str(),
        OsStr::new("--socket-path"),
        socket.as_os_str(),
    ]);
    wait_for_path(&socket);

    fs::write(&pidfile, "").expect("failed to create empty pidfile");
    assert_still_running(&mut sentinel);

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    worker.kill().expect("failed to kill worker");

    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(stderr.contains(&format!("Monitoring worker process {}", worker.id())));
}

#[test]
fn other_files_in_the_directory_are_ignored() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");
    let socket = temp.path().join("ctrl.sock");

    let mut sentinel = spawn_sentinel([
        OsStr::new("watch"),
        OsStr::new("--pidfile"),
        pidfile.as_os_str(),
        OsStr::new("--socket-path"),
        socket.as_os_str(),
    ]);
    wait_for_path(&socket);

    let mut decoy = spawn_worker();
    fs::write(temp.path().join("w.pid.tmp"), format!("{}\n", decoy.id()))
        .expect("failed to write decoy");
    decoy.kill().expect("failed to kill decoy");
    decoy.wait().expect("failed to reap decoy");
    assert_still_running(&mut sentinel);

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    worker.kill().expect("failed to kill worker");

    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(stderr.contains(&format!("Monitoring worker process {}", worker.id())));
    assert!(!stderr.contains(&format!("Discovered worker pid {} ", decoy.id())));
}

#[test]
fn pidfile_written_before_start_is_found() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    worker.kill().expect("failed to kill worker");

    let sentinel = spawn_sentinel([
        OsStr::new("watch"),
        OsStr::new("--pidfile"),
        pidfile.as_os_str(),
    ]);
    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(
        stderr.contains("via existing pidfile"),
        "existing pidfile was not read:\n{stderr}"
    );
}
