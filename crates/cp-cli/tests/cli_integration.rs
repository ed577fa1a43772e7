//! CLI integration tests
//!
//! Tests the cocalc-plus CLI using assert_cmd. Every invocation gets its own
//! config file and data directory.

use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    /// Point the scheduler at a program that cannot exist
    fn with_missing_scheduler(self) -> Self {
        std::fs::write(
            self.config(),
            "[sync]\nscheduler = \"/nonexistent/reflect-sync\"\nstartup_grace = 50\n",
        )
        .unwrap();
        self
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("cocalc-plus")
            .expect("Failed to locate cocalc-plus binary - ensure it's built before running tests");
        cmd.arg("--config")
            .arg(self.config())
            .arg("--data-dir")
            .arg(self.dir.path().join("data"))
            .env_remove("RUST_LOG");
        cmd
    }

    fn root(&self, name: &str) -> String {
        self.dir.path().join("roots").join(name).display().to_string()
    }
}

#[test]
fn test_cli_help() {
    Env::new()
        .cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cocalc-plus"))
        .stdout(predicate::str::contains("ssh"))
        .stdout(predicate::str::contains("sync"));
}

#[test]
fn test_cli_version() {
    Env::new()
        .cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cocalc-plus"));
}

#[test]
fn test_cli_ssh_help() {
    Env::new()
        .cmd()
        .args(["ssh", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--local-port"))
        .stdout(predicate::str::contains("--forward-only"))
        .stdout(predicate::str::contains("upgrades"));
}

#[test]
fn test_cli_unknown_command() {
    Env::new()
        .cmd()
        .arg("unknown-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_cli_ssh_requires_target() {
    Env::new().cmd().arg("ssh").assert().failure();
}

#[test]
fn test_cli_invalid_local_port() {
    Env::new()
        .cmd()
        .args(["ssh", "me@box", "--local-port", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected a port number or 'auto'"));

    Env::new()
        .cmd()
        .args(["ssh", "me@box", "--local-port", "0"])
        .assert()
        .failure();
}

#[test]
fn test_cli_config_path() {
    let env = Env::new();
    env.cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(env.config().display().to_string()));
}

#[test]
fn test_cli_config_set_get() {
    let env = Env::new();
    env.cmd()
        .args(["config", "set", "remote.upgrade_concurrency", "2"])
        .assert()
        .success();
    env.cmd()
        .args(["config", "get", "remote.upgrade_concurrency"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
    env.cmd()
        .args(["config", "get", "remote.nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Key not found"));
}

#[test]
fn test_cli_ssh_list_empty_registry() {
    Env::new()
        .cmd()
        .args(["ssh", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No ssh targets"));
}

#[test]
fn test_cli_ssh_star_unknown_target() {
    Env::new()
        .cmd()
        .args(["ssh", "star", "me@box"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not registered"));
}

#[test]
fn test_cli_sync_create_and_list() {
    let env = Env::new().with_missing_scheduler();
    env.cmd()
        .args(["sync", "create", "--name", "docs", "--stopped", "-l", "env=dev"])
        .arg(env.root("alpha"))
        .arg(env.root("beta"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Created sync session docs"));

    env.cmd()
        .args(["sync", "list", "--long"])
        .assert()
        .success()
        .stdout(predicate::str::contains("docs"))
        .stdout(predicate::str::contains("stopped"))
        .stdout(predicate::str::contains("env=dev"));

    env.cmd()
        .args(["sync", "list", "-s", "env=prod"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No sync sessions"));

    // the same name twice is rejected
    env.cmd()
        .args(["sync", "create", "--name", "docs", "--stopped"])
        .arg(env.root("a2"))
        .arg(env.root("b2"))
        .assert()
        .failure();
}

#[test]
fn test_cli_sync_start_with_missing_scheduler_marks_error() {
    let env = Env::new().with_missing_scheduler();
    env.cmd()
        .args(["sync", "create", "--name", "docs", "--stopped"])
        .arg(env.root("alpha"))
        .arg(env.root("beta"))
        .assert()
        .success();

    env.cmd().args(["sync", "start", "docs"]).assert().success();

    env.cmd()
        .args(["sync", "status", "docs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("desired running, actual error"));

    env.cmd().args(["sync", "remove", "docs"]).assert().success();
    env.cmd()
        .args(["sync", "status", "docs"])
        .assert()
        .failure();
}

#[test]
fn test_cli_sync_invalid_endpoint() {
    let env = Env::new();
    env.cmd()
        .args(["sync", "create", "--name", "bad", "--stopped", "box:", "/tmp"])
        .assert()
        .failure();
}

#[test]
fn test_cli_forward_create_and_list() {
    let env = Env::new();
    env.cmd()
        .args([
            "forward",
            "create",
            "--name",
            "jupyter",
            "--local-port",
            "18888",
            "--remote-port",
            "8888",
            "--stopped",
            "me@box:2222",
        ])
        .assert()
        .success();

    env.cmd()
        .args(["forward", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jupyter"))
        .stdout(predicate::str::contains("18888 -> 8888"));

    env.cmd().args(["forward", "remove", "jupyter"]).assert().success();
    env.cmd()
        .args(["forward", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No forwards"));
}
