//! Runs the `carcass` binary against the in-memory backend.

use std::process::{Command, Output};

fn carcass(dir: &tempfile::TempDir, args: &[&str]) -> Output {
    let config = dir.path().join("config.yaml");
    std::fs::write(&config, "hypervisor:\n  backend: mock\n").unwrap();

    Command::new(env!("CARGO_BIN_EXE_carcass"))
        .arg("--config")
        .arg(&config)
        .arg("-d")
        .arg(dir.path())
        .args(args)
        .env_remove("CARCASS_CONNECT")
        .output()
        .unwrap()
}

#[test]
fn test_list_without_networks() {
    let dir = tempfile::tempdir().unwrap();

    let output = carcass(&dir, &["list"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_stop_requires_an_environment() {
    let dir = tempfile::tempdir().unwrap();

    let output = carcass(&dir, &["stop"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing environment"));
}

#[test]
fn test_unknown_environment_fails() {
    let dir = tempfile::tempdir().unwrap();

    let output = carcass(&dir, &["start", "lab"]);
    assert!(!output.status.success());
}

#[test]
fn test_image_name_is_validated() {
    let dir = tempfile::tempdir().unwrap();

    let output = carcass(&dir, &["image", "add", "../evil", "/tmp/x.qcow2"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid image name"));
}
