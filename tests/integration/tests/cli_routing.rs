//! CLI binary integration tests.
//!
//! These tests run the compiled `shardlink` binary to check top-level
//! command routing, help text, and error handling.

use std::path::PathBuf;
use std::process::Command;

/// Locate the compiled `shardlink` binary in the workspace target directory.
fn shardlink_bin() -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    // tests/integration -> workspace root
    let workspace_root = manifest_dir
        .parent()
        .expect("tests/ parent")
        .parent()
        .expect("workspace root");
    let bin = workspace_root.join("target").join("debug").join("shardlink");
    assert!(
        bin.exists(),
        "shardlink binary not found at {}; run `cargo build -p shardlink-cli` first",
        bin.display()
    );
    bin
}

fn shardlink_cmd() -> Command {
    let mut cmd = Command::new(shardlink_bin());
    cmd.env_remove("SHARDLINK_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_version() {
    let output = shardlink_cmd().arg("version").output().expect("run shardlink");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("shardlink"), "got: {}", stdout);
}

#[test]
fn test_cli_help_lists_commands() {
    let output = shardlink_cmd().arg("--help").output().expect("run shardlink");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("worker"), "got: {}", stdout);
    assert!(stdout.contains("config"), "got: {}", stdout);
}

#[test]
fn test_cli_unknown_command_fails() {
    let output = shardlink_cmd().arg("frobnicate").output().expect("run shardlink");
    assert!(!output.status.success());
}

#[test]
fn test_cli_config_init_then_validate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shardlink.json5");

    let init = shardlink_cmd()
        .args(["--config", path.to_str().unwrap(), "config", "init"])
        .output()
        .expect("run shardlink");
    assert!(init.status.success());
    assert!(path.exists());

    // The default config has no password.
    let validate = shardlink_cmd()
        .args(["--config", path.to_str().unwrap(), "config", "validate"])
        .env_remove("SHARDLINK_PASSWORD")
        .output()
        .expect("run shardlink");
    assert!(!validate.status.success());

    let validate = shardlink_cmd()
        .args(["--config", path.to_str().unwrap(), "config", "validate"])
        .env("SHARDLINK_PASSWORD", "pw")
        .output()
        .expect("run shardlink");
    assert!(validate.status.success());
}

#[test]
fn test_cli_config_path_honours_flag() {
    let output = shardlink_cmd()
        .args(["--config", "/tmp/custom.json5", "config", "path"])
        .output()
        .expect("run shardlink");
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "/tmp/custom.json5");
}
