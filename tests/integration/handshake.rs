#[path = "common/mod.rs"]
mod common;

use std::{
    ffi::OsStr,
    fs,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    process::Child,
};

use common::{assert_still_running, spawn_sentinel, spawn_worker, wait_for_exit, wait_for_path};
use tempfile::tempdir;

fn watch_with_socket(pidfile: &Path, socket: &Path) -> Child {
    spawn_sentinel([
        OsStr::new("watch"),
        OsStr::new("--pidfile"),
        pidfile.as_os_str(),
        OsStr::new("--socket-path"),
        socket.as_os_str(),
    ])
}

#[test]
fn repeated_handshakes_keep_the_sentinel_waiting() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");
    let socket = temp.path().join("ctrl.sock");

    let mut sentinel = watch_with_socket(&pidfile, &socket);
    wait_for_path(&socket);

    let first = UnixStream::connect(&socket).expect("first handshake failed");
    drop(first);
    assert_still_running(&mut sentinel);

    let second = UnixStream::connect(&socket).expect("second handshake failed");
    assert_still_running(&mut sentinel);
    drop(second);
    assert_still_running(&mut sentinel);

    let third = UnixStream::connect(&socket).expect("third handshake failed");
    assert_still_running(&mut sentinel);

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    worker.kill().expect("failed to kill worker");

    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");
    drop(third);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert_eq!(
        stderr.matches("Handshake client connected").count(),
        3,
        "unexpected handshake count:\n{stderr}"
    );
    assert!(!socket.exists(), "handshake socket left behind");
}

#[test]
fn stale_socket_from_a_previous_run_is_replaced() {
    let temp = tempdir().expect("failed to create tempdir");
    let pidfile = temp.path().join("w.pid");
    let socket = temp.path().join("ctrl.sock");
    drop(UnixListener::bind(&socket).expect("failed to create stale socket"));

    let mut sentinel = watch_with_socket(&pidfile, &socket);
    assert_still_running(&mut sentinel);
    UnixStream::connect(&socket).expect("handshake against replaced socket failed");

    let mut worker = spawn_worker();
    fs::write(&pidfile, format!("{}\n", worker.id())).expect("failed to write pidfile");
    worker.kill().expect("failed to kill worker");

    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");
    assert!(output.status.success());
}

#[test]
fn known_pid_is_watched_with_attach() {
    let temp = tempdir().expect("failed to create tempdir");
    let socket = temp.path().join("ctrl.sock");
    let mut worker = spawn_worker();
    let pid = worker.id().to_string();

    let mut sentinel = spawn_sentinel([
        OsStr::new("attach"),
        OsStr::new("--pid"),
        OsStr::new(&pid),
        OsStr::new("--socket-path"),
        socket.as_os_str(),
    ]);
    wait_for_path(&socket);
    UnixStream::connect(&socket).expect("handshake failed");
    assert_still_running(&mut sentinel);

    worker.kill().expect("failed to kill worker");
    let output = wait_for_exit(sentinel);
    worker.wait().expect("failed to reap worker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "sentinel failed:\n{stderr}");
    assert!(stderr.contains(&format!("Monitoring worker process {pid}")));
}
