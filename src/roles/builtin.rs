//! Roles compiled into the binary.

use serde_json::{json, Value};

use super::Role;
use crate::playbook::task::Task;
use crate::vars::Vars;

pub(super) fn roles() -> Vec<Role> {
    vec![docker()]
}

fn vars(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Vars {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Docker CE from the upstream apt repository.
fn docker() -> Role {
    let name = "docker";
    let mut tasks = vec![
        Task::new("ensure-repo-added", "apt_repository")
            .with_param("repo", "{{ docker_repo }}")
            .with_param("filename", "docker")
            .with_param("key_url", "{{ docker_repo_url }}/gpg")
            .with_param("keyring", "{{ docker_keyring }}"),
        Task::new("ensure-packages-installed", "package")
            .with_param("name", "{{ docker_packages }}")
            .with_param("state", "present"),
    ];
    for task in &mut tasks {
        task.r#become = Some(true);
        task.role = Some(name.to_string());
    }

    Role {
        name: name.to_string(),
        tasks,
        defaults: vars([
            (
                "docker_packages",
                json!(["docker-ce", "docker-ce-cli", "containerd.io"]),
            ),
            ("docker_arch", json!("amd64")),
            ("docker_release", json!("jammy")),
            (
                "docker_repo_url",
                json!("https://download.docker.com/linux/ubuntu"),
            ),
            ("docker_keyring", json!("/etc/apt/keyrings/docker.gpg")),
            (
                "docker_repo",
                json!("deb [arch={{ docker_arch }} signed-by={{ docker_keyring }}] {{ docker_repo_url }} {{ docker_release }} stable"),
            ),
        ]),
        path: None,
    }
}
