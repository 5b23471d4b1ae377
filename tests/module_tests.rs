//! Built-in module tests against the local transport.
//!
//! Every module is driven through plan, apply, plan again: the second plan
//! must report nothing to do.

use std::path::Path;

use homestead::connection::{Connection, LocalConnection};
use homestead::modules::{self, ModuleContext, ModuleParams, ModuleRegistry, Plan};
use serde_json::json;
use tempfile::tempdir;

fn params(value: serde_json::Value) -> ModuleParams {
    serde_json::from_value(value).unwrap()
}

async fn plan(
    registry: &ModuleRegistry,
    conn: &dyn Connection,
    action: &str,
    params: &ModuleParams,
) -> Plan {
    registry
        .get(action)
        .unwrap()
        .plan(conn, params, &ModuleContext::new())
        .await
        .unwrap()
}

/// Plans, applies and re-plans; returns the first plan's message.
async fn converge(action: &str, params: ModuleParams) -> String {
    let registry = ModuleRegistry::with_builtins();
    registry.validate(action, &params).unwrap();
    let conn = LocalConnection::new();

    let first = plan(&registry, &conn, action, &params).await;
    assert!(first.is_change(), "{} should change: {}", action, first.msg);
    let mutation = first.mutation.as_ref().unwrap();
    modules::apply(&conn, mutation, &ModuleContext::new())
        .await
        .unwrap();

    let second = plan(&registry, &conn, action, &params).await;
    assert!(
        !second.is_change(),
        "{} should be converged: {}",
        action,
        second.msg
    );
    first.msg
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_file_directory_converges() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("data/media");

    let msg = converge(
        "file",
        params(json!({"path": path_str(&target), "state": "directory", "mode": "0750"})),
    )
    .await;

    assert!(msg.contains("create directory"));
    assert!(target.is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }
}

#[tokio::test]
async fn test_file_absent_removes() {
    let dir = tempdir().unwrap();
    let target = dir.path().join("stale");
    std::fs::write(&target, "x").unwrap();

    converge("file", params(json!({"path": path_str(&target), "state": "absent"}))).await;
    assert!(!target.exists());
}

#[tokio::test]
async fn test_copy_content_converges() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("motd");

    let msg = converge(
        "copy",
        params(json!({"dest": path_str(&dest), "content": "welcome to the homelab\n"})),
    )
    .await;

    assert!(msg.starts_with("create "));
    assert_eq!(
        std::fs::read_to_string(&dest).unwrap(),
        "welcome to the homelab\n"
    );
}

#[tokio::test]
async fn test_copy_updates_changed_content() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("motd");
    std::fs::write(&dest, "old\n").unwrap();

    let msg = converge(
        "copy",
        params(json!({"dest": path_str(&dest), "content": "new\n"})),
    )
    .await;

    assert!(msg.starts_with("update "));
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new\n");
}

#[tokio::test]
async fn test_lineinfile_replaces_matching_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sshd_config");
    std::fs::write(&path, "Port 22\nPermitRootLogin yes\nUsePAM yes\n").unwrap();

    converge(
        "lineinfile",
        params(json!({
            "path": path_str(&path),
            "regexp": "^PermitRootLogin",
            "line": "PermitRootLogin no",
        })),
    )
    .await;

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "Port 22\nPermitRootLogin no\nUsePAM yes\n"
    );
}

#[tokio::test]
async fn test_lineinfile_appends_missing_line() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hosts");
    std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();

    converge(
        "lineinfile",
        params(json!({"path": path_str(&path), "line": "10.0.0.5 nas"})),
    )
    .await;

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "127.0.0.1 localhost\n10.0.0.5 nas\n"
    );
}

#[tokio::test]
async fn test_lineinfile_refuses_non_utf8_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.conf");
    let original = b"name=caf\xe9\n".to_vec();
    std::fs::write(&path, &original).unwrap();

    let registry = ModuleRegistry::with_builtins();
    let conn = LocalConnection::new();
    let err = registry
        .get("lineinfile")
        .unwrap()
        .plan(
            &conn,
            &params(json!({"path": path_str(&path), "line": "port=22"})),
            &ModuleContext::new(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("not valid UTF-8"), "{}", err);
    assert_eq!(std::fs::read(&path).unwrap(), original);
}

#[tokio::test]
async fn test_command_guarded_by_creates() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("initialized");

    converge(
        "command",
        params(json!({
            "cmd": format!("touch {}", path_str(&marker)),
            "creates": path_str(&marker),
        })),
    )
    .await;

    assert!(marker.exists());
}

#[tokio::test]
async fn test_failed_step_is_an_error() {
    let dir = tempdir().unwrap();
    let registry = ModuleRegistry::with_builtins();
    let conn = LocalConnection::new();
    let params = params(json!({
        "cmd": "exit 7",
        "creates": path_str(&dir.path().join("never")),
    }));

    let plan = plan(&registry, &conn, "command", &params).await;
    let err = modules::apply(&conn, plan.mutation.as_ref().unwrap(), &ModuleContext::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains('7'), "{}", err);
}

#[test]
fn test_validation_rejects_bad_params() {
    let registry = ModuleRegistry::with_builtins();

    assert!(registry
        .validate("command", &params(json!({"cmd": "reboot"})))
        .is_err());
    assert!(registry
        .validate("file", &params(json!({"path": "/tmp/x", "mode": "999"})))
        .is_err());
    assert!(registry
        .validate("service", &params(json!({"name": "docker", "state": "restarted"})))
        .is_err());
    assert!(registry
        .validate("nonexistent", &params(json!({})))
        .is_err());
    assert!(registry
        .validate("user", &params(json!({"name": "media", "groups": ["docker"]})))
        .is_ok());
}
