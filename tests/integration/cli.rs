use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn sentinel() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("vfs-sentinel"))
}

#[test]
fn help_lists_subcommands() {
    sentinel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("watch"))
        .stdout(predicate::str::contains("attach"))
        .stdout(predicate::str::contains("spawn"));
}

#[test]
fn missing_subcommand_is_rejected() {
    sentinel().assert().failure();
}

#[test]
fn attach_requires_a_positive_pid() {
    sentinel()
        .args(["attach", "--pid", "0"])
        .assert()
        .failure();
}

#[test]
fn watch_without_discovery_has_nothing_to_do() {
    let temp = tempdir().expect("failed to create tempdir");
    sentinel()
        .current_dir(temp.path())
        .args(["watch"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Nothing to supervise"));
}

#[test]
fn invalid_config_fails_before_setup() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = temp.path().join("sentinel.yaml");
    fs::write(&config, "listen_backlog: 0\n").expect("failed to write config");

    sentinel()
        .arg("--config")
        .arg(&config)
        .args(["watch", "--pidfile", "w.pid"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("listen_backlog"));
}

#[test]
fn missing_config_file_is_reported() {
    let temp = tempdir().expect("failed to create tempdir");
    sentinel()
        .arg("--config")
        .arg(temp.path().join("absent.yaml"))
        .arg("watch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn config_file_in_working_directory_is_used() {
    let temp = tempdir().expect("failed to create tempdir");
    fs::write(
        temp.path().join("vfs-sentinel.yaml"),
        "accept_failure: sometimes\n",
    )
    .expect("failed to write config");

    sentinel()
        .current_dir(temp.path())
        .arg("watch")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid YAML format"));
}

#[test]
fn vanished_pid_exits_cleanly() {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("failed to spawn");
    let pid = child.id();
    child.wait().expect("failed to reap");

    sentinel()
        .args(["attach", "--pid", &pid.to_string()])
        .assert()
        .success();
}
