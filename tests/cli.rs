//! Integration tests for the hatch CLI.
//!
//! These run the real binary and only cover paths that fail or finish
//! before a Docker daemon is contacted.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

/// Creates a Command for the hatch binary.
#[allow(deprecated)]
fn hatch() -> Command {
    let mut cmd = Command::cargo_bin("hatch").expect("failed to find hatch binary");
    cmd.env_remove("HATCH_CONFIG");
    cmd
}

/// Creates a Command for hatch running in a specific directory.
fn hatch_in(dir: &TempDir) -> Command {
    let mut cmd = hatch();
    cmd.current_dir(dir.path());
    cmd
}

/// Writes `hatch.toml` into `dir`.
fn write_config(dir: &TempDir, contents: &str) {
    fs::write(dir.path().join("hatch.toml"), contents).unwrap();
}

// -----------------------------------------------------------------------------
// Help and version tests
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    hatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("hatch"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("exec"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("remove"))
        .stdout(predicate::str::contains("buildkit"));
}

#[test]
fn test_version_shows_version() {
    hatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hatch"));
}

#[test]
fn test_buildkit_help_shows_subcommands() {
    hatch()
        .args(["buildkit", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ensure"))
        .stdout(predicate::str::contains("remove"))
        .stdout(predicate::str::contains("reconcile"));
}

#[test]
fn test_create_help_shows_options() {
    hatch()
        .args(["create", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--session"))
        .stdout(predicate::str::contains("--image"))
        .stdout(predicate::str::contains("--project"))
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--env"))
        .stdout(predicate::str::contains("--start"));
}

#[test]
fn test_exec_help_shows_options() {
    hatch()
        .args(["exec", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--command"))
        .stdout(predicate::str::contains("--workdir"));
}

#[test]
fn test_stop_help_shows_timeout() {
    hatch()
        .args(["stop", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--timeout"));
}

#[test]
fn test_exec_requires_session() {
    hatch()
        .arg("exec")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<SESSION>"));
}

// -----------------------------------------------------------------------------
// Config tests
// -----------------------------------------------------------------------------

#[test]
fn test_missing_config_file_fails() {
    let temp = TempDir::new().unwrap();
    hatch_in(&temp)
        .args(["--config", "nope.toml", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_invalid_config_fails() {
    let temp = TempDir::new().unwrap();
    write_config(&temp, "[sandbox\nimage = ");
    hatch_in(&temp)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_buildkit_disabled_fails_before_docker() {
    let temp = TempDir::new().unwrap();
    write_config(&temp, "[buildkit]\nenabled = false\n");
    hatch_in(&temp)
        .args(["buildkit", "ensure", "proj"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disabled"));
}

#[test]
fn test_reconcile_loop_disabled_fails() {
    let temp = TempDir::new().unwrap();
    write_config(&temp, "[buildkit]\nenabled = false\n");
    hatch_in(&temp)
        .args(["buildkit", "reconcile", "--interval", "5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disabled"));
}

// -----------------------------------------------------------------------------
// Argument validation tests
// -----------------------------------------------------------------------------

#[test]
fn test_create_rejects_bad_port() {
    let temp = TempDir::new().unwrap();
    hatch_in(&temp)
        .args(["create", "--port", "bogus"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid container port"));
}

#[test]
fn test_create_rejects_bad_env() {
    let temp = TempDir::new().unwrap();
    hatch_in(&temp)
        .args(["create", "--env", "NOVALUE"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected KEY=VALUE"));
}

#[test]
fn test_exec_without_command_fails() {
    let temp = TempDir::new().unwrap();
    hatch_in(&temp)
        .args(["exec", "session-1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No command given"));
}

#[test]
fn test_exec_rejects_command_and_args_together() {
    hatch()
        .args(["exec", "s1", "-c", "ls", "--", "pwd"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
