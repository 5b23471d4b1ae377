//! CLI tests for Homestead
//!
//! Runs the binary against a local-transport node, so every playbook here
//! acts on a temporary directory of the machine running the tests.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::{tempdir, TempDir};

// Helper to get a command for testing
fn homestead_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("homestead").unwrap();
    cmd.current_dir(dir)
        .env_remove("HOMESTEAD_CONFIG")
        .env_remove("HOMESTEAD_FORKS")
        .env_remove("HOMESTEAD_INVENTORY")
        .env_remove("HOMESTEAD_ROLES_PATH")
        .env_remove("RUST_LOG")
        .arg("--no-color");
    cmd
}

/// Workspace with a local inventory and a playbook creating a directory.
fn workspace() -> TempDir {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("hosts"), "[lab]\nbox connection_transport=local\n").unwrap();
    let target = dir.path().join("srv/data");
    fs::write(
        dir.path().join("site.yml"),
        format!(
            "- name: prepare storage\n  hosts: lab\n  tasks:\n    - name: data-dir\n      file:\n        path: {}\n        state: directory\n",
            target.display()
        ),
    )
    .unwrap();
    dir
}

#[test]
fn test_help() {
    let dir = tempdir().unwrap();
    homestead_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("list-hosts"));
}

#[test]
fn test_run_converges_then_reports_ok() {
    let dir = workspace();

    homestead_cmd(dir.path())
        .args(["run", "site.yml", "-i", "hosts"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("PLAY [prepare storage]"))
        .stdout(predicate::str::contains("changed: [box] => data-dir"))
        .stdout(predicate::str::contains("PLAY RECAP"));
    assert!(dir.path().join("srv/data").is_dir());

    homestead_cmd(dir.path())
        .args(["run", "site.yml", "-i", "hosts"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("ok: [box] => data-dir"));
}

#[test]
fn test_check_mode_changes_nothing() {
    let dir = workspace();

    homestead_cmd(dir.path())
        .args(["run", "site.yml", "-i", "hosts", "--check"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("changed: [box] => data-dir"))
        .stdout(predicate::str::contains("check mode"));
    assert!(!dir.path().join("srv/data").exists());
}

#[test]
fn test_failed_task_exits_2() {
    let dir = workspace();
    fs::write(
        dir.path().join("fail.yml"),
        format!(
            "- hosts: all\n  tasks:\n    - name: broken\n      command:\n        cmd: exit 3\n        creates: {}\n",
            dir.path().join("never").display()
        ),
    )
    .unwrap();

    homestead_cmd(dir.path())
        .args(["run", "fail.yml", "-i", "hosts"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("failed: [box] => broken"));
}

#[test]
fn test_load_errors_exit_4() {
    let dir = workspace();
    fs::write(dir.path().join("bad.yml"), "- hosts: all\n  roles: [jellyfin]\n").unwrap();

    homestead_cmd(dir.path())
        .args(["run", "bad.yml", "-i", "hosts"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("jellyfin"));

    homestead_cmd(dir.path())
        .args(["run", "missing.yml", "-i", "hosts"])
        .assert()
        .code(4);

    homestead_cmd(dir.path())
        .args(["run", "site.yml", "-i", "nope"])
        .assert()
        .code(4);
}

#[test]
fn test_missing_variable_exits_4_before_running() {
    let dir = workspace();
    let target = dir.path().join("motd");
    fs::write(
        dir.path().join("vars.yml"),
        format!(
            "- hosts: all\n  tasks:\n    - copy:\n        dest: {}\n        content: \"{{{{ motd }}}}\"\n",
            target.display()
        ),
    )
    .unwrap();

    homestead_cmd(dir.path())
        .args(["run", "vars.yml", "-i", "hosts"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("motd"));
    assert!(!target.exists());

    homestead_cmd(dir.path())
        .args(["run", "vars.yml", "-i", "hosts", "-e", "motd=hello"])
        .assert()
        .code(0);
    assert_eq!(fs::read_to_string(&target).unwrap(), "hello");
}

#[test]
fn test_json_output_and_report_file() {
    let dir = workspace();
    let report_path = dir.path().join("report.json");

    let output = homestead_cmd(dir.path())
        .args(["--output", "json", "run", "site.yml", "-i", "hosts", "--report"])
        .arg(&report_path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let stdout: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stdout["playbook"], "site");
    assert_eq!(stdout["plays"][0]["nodes"][0]["state"], "completed");
    assert_eq!(stdout["plays"][0]["nodes"][0]["tasks"][0]["outcome"], "changed");

    let file: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(file["plays"], stdout["plays"]);
}

#[test]
fn test_validate() {
    let dir = workspace();

    homestead_cmd(dir.path())
        .args(["validate", "site.yml", "-i", "hosts"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("1 task(s), 1 node(s)"))
        .stdout(predicate::str::contains("is valid"));
    assert!(!dir.path().join("srv/data").exists());
}

#[test]
fn test_list_hosts() {
    let dir = workspace();

    homestead_cmd(dir.path())
        .args(["list-hosts", "-i", "hosts", "lab"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hosts (1)"))
        .stdout(predicate::str::contains("box"));

    let output = homestead_cmd(dir.path())
        .args(["--output", "json", "list-hosts", "-i", "hosts"])
        .output()
        .unwrap();
    let nodes: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(nodes[0]["name"], "box");
    assert_eq!(nodes[0]["transport"], "local");
}

#[test]
fn test_invalid_extra_vars_exit_1() {
    let dir = workspace();
    homestead_cmd(dir.path())
        .args(["run", "site.yml", "-i", "hosts", "-e", "novalue"])
        .assert()
        .code(1);
}
