//! CLI smoke tests that need no container engine
//!
//! Every command here fails or succeeds before the runtime is invoked, so the
//! tests run on hosts without docker or podman.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cradle(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cradle").unwrap();
    cmd.env_remove("CRADLE_RUNTIME")
        .env_remove("CRADLE_STATE_DIR")
        .env_remove("CRADLE_WORKSPACE_ROOT")
        .env_remove("CRADLE_STORAGE_ROOT")
        .arg("--data-dir")
        .arg(data_dir.path());
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("cradle").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("logs"))
        .stdout(predicate::str::contains("lsp"));
}

#[test]
fn test_list_empty_store_as_json() {
    let data = TempDir::new().unwrap();
    let output = cradle(&data).args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed, serde_json::json!([]));
    assert!(data.path().join("objects").exists());
}

#[test]
fn test_create_rejects_invalid_image() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .args(["create", "--name", "demo", "--image", "Not A Valid Image"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid spec"));
}

#[test]
fn test_create_rejects_reserved_env() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .args([
            "create",
            "--name",
            "demo",
            "--image",
            "node:20",
            "--env",
            "CRADLE_APP_ID=spoofed",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("reserved"));
}

#[test]
fn test_unknown_app_is_not_found() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .args(["status", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_delete_unknown_app_succeeds() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .args(["delete", "does-not-exist", "--purge-storage"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted does-not-exist"));
}

#[test]
fn test_invalid_config_file_is_reported() {
    let data = TempDir::new().unwrap();
    let config = data.path().join("cradle.toml");
    std::fs::write(&config, "[runtime\n").unwrap();
    cradle(&data)
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration"));
}

#[test]
fn test_unknown_runtime_override_is_rejected() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .env("CRADLE_RUNTIME", "lxc")
        .arg("list")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unknown runtime"));
}

#[test]
fn test_files_rm_requires_paths() {
    let data = TempDir::new().unwrap();
    cradle(&data)
        .args(["files", "rm", "app1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}
