//! Playbook definitions, loading and resolution.
//!
//! A playbook is a YAML list of plays. Each play targets a host pattern and
//! holds an ordered list of entries, where an entry is either a task or a
//! reference to a role:
//!
//! ```yaml
//! - name: Container hosts
//!   hosts: docker_hosts
//!   become: true
//!   vars:
//!     docker_packages: [docker-ce]
//!   roles:
//!     - docker
//!   tasks:
//!     - name: Deploy user
//!       user: { name: deploy, groups: [docker] }
//!     - role: monitoring
//!       vars: { exporter_port: 9100 }
//! ```
//!
//! Loading checks structure and role references. [`Playbook::resolve`]
//! expands roles and substitutes variables for every play up front, so a
//! missing variable or an invalid task stops the run before anything
//! executes.

mod loader;
pub mod task;

pub use loader::PlaybookLoader;
pub use task::Task;

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::modules::ModuleRegistry;
use crate::roles::RoleLibrary;
use crate::vars::{substitute, VarScope, Vars};

/// A playbook containing one or more plays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Playbook {
    /// Name of the playbook, derived from the file name
    pub name: String,

    /// The plays in this playbook
    pub plays: Vec<Play>,

    /// Path to the playbook file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

/// A play within a playbook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Play {
    /// Name of the play
    pub name: String,

    /// Host pattern to match against inventory
    pub hosts: String,

    /// Variables for this play
    pub vars: Vars,

    /// Default privilege escalation for the play's tasks
    #[serde(rename = "become")]
    pub r#become: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    /// Tasks and role references, in execution order
    pub entries: Vec<PlayEntry>,
}

/// One entry of a play.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayEntry {
    /// A task declared directly in the play
    Task(Task),
    /// A role to expand in place
    Role(RoleRef),
}

/// Reference to a role with optional variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleRef {
    /// Role name
    pub name: String,
    /// Variables overriding the play's variables and the role defaults
    pub vars: Vars,
}

impl RoleRef {
    /// Reference without variables.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vars: Vars::new(),
        }
    }
}

/// A play with roles expanded and every variable substituted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPlay {
    /// Name of the play
    pub name: String,
    /// Host pattern
    pub hosts: String,
    /// Default privilege escalation
    #[serde(rename = "become")]
    pub r#become: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,
    /// Tasks in execution order
    pub tasks: Arc<Vec<Task>>,
}

impl Play {
    /// Creates an empty play.
    pub fn new(name: impl Into<String>, hosts: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: hosts.into(),
            vars: Vars::new(),
            r#become: false,
            become_user: None,
            entries: Vec::new(),
        }
    }

    /// Role references of this play, in order.
    pub fn role_refs(&self) -> impl Iterator<Item = &RoleRef> {
        self.entries.iter().filter_map(|entry| match entry {
            PlayEntry::Role(role) => Some(role),
            PlayEntry::Task(_) => None,
        })
    }

    /// Expands this play.
    ///
    /// Precedence, highest first: `extra_vars`, role reference vars, play
    /// vars, role defaults. Tasks declared directly in the play see
    /// `extra_vars` and play vars.
    pub fn resolve(
        &self,
        library: &RoleLibrary,
        registry: &ModuleRegistry,
        extra_vars: &Vars,
    ) -> Result<ResolvedPlay> {
        let play_scope = VarScope::new().layer(extra_vars).layer(&self.vars);
        let play_context = format!("play '{}'", self.name);

        let name = substitute_text(&self.name, &play_scope, &play_context)?;
        let hosts = substitute_text(&self.hosts, &play_scope, &play_context)?;

        let mut tasks = Vec::new();
        for entry in &self.entries {
            match entry {
                PlayEntry::Task(task) => tasks.push(task.substituted(&play_scope)?),
                PlayEntry::Role(role_ref) => {
                    let role = library.lookup(&role_ref.name)?.ok_or_else(|| Error::UnknownRole {
                        role: role_ref.name.clone(),
                        play: self.name.clone(),
                    })?;
                    let overrides = VarScope::new()
                        .layer(extra_vars)
                        .layer(&role_ref.vars)
                        .layer(&self.vars)
                        .flatten();
                    tasks.extend(role.resolve(&overrides)?);
                }
            }
        }

        for task in &tasks {
            registry
                .validate(&task.action, &task.params)
                .map_err(|e| Error::invalid_task(task.display_name(), e.to_string()))?;
        }

        Ok(ResolvedPlay {
            name,
            hosts,
            r#become: self.r#become,
            become_user: self.become_user.clone(),
            tasks: Arc::new(tasks),
        })
    }
}

impl Playbook {
    /// Number of plays.
    pub fn play_count(&self) -> usize {
        self.plays.len()
    }

    /// Expands every play, failing on the first load or variable error.
    pub fn resolve(
        &self,
        library: &RoleLibrary,
        registry: &ModuleRegistry,
        extra_vars: &Vars,
    ) -> Result<Vec<ResolvedPlay>> {
        self.plays
            .iter()
            .map(|play| play.resolve(library, registry, extra_vars))
            .collect()
    }
}

fn substitute_text(text: &str, scope: &VarScope<'_>, context: &str) -> Result<String> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }
    let value = substitute(&serde_json::Value::String(text.to_string()), scope, context)?;
    Ok(crate::vars::render_text(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn vars(value: serde_json::Value) -> Vars {
        serde_json::from_value(value).unwrap()
    }

    fn docker_play() -> Play {
        let mut play = Play::new("containers", "all");
        play.entries.push(PlayEntry::Role(RoleRef::new("docker")));
        play
    }

    #[test]
    fn test_play_vars_override_role_defaults() {
        let mut play = docker_play();
        play.vars = vars(json!({"docker_packages": ["docker-ce"]}));

        let resolved = play
            .resolve(
                &RoleLibrary::with_builtins(),
                &ModuleRegistry::with_builtins(),
                &Vars::new(),
            )
            .unwrap();
        let install = &resolved.tasks[1];
        assert_eq!(install.name, "ensure-packages-installed");
        assert_eq!(install.params["name"], json!(["docker-ce"]));
    }

    #[test]
    fn test_precedence_order() {
        let mut play = docker_play();
        play.vars = vars(json!({"docker_release": "focal", "docker_arch": "arm64"}));
        play.entries = vec![PlayEntry::Role(RoleRef {
            name: "docker".into(),
            vars: vars(json!({"docker_release": "noble", "docker_arch": "riscv64"})),
        })];
        let extra = vars(json!({"docker_arch": "s390x"}));

        let resolved = play
            .resolve(&RoleLibrary::with_builtins(), &ModuleRegistry::with_builtins(), &extra)
            .unwrap();
        let repo = resolved.tasks[0].params["repo"].as_str().unwrap().to_string();
        assert!(repo.contains("arch=s390x"), "{}", repo);
        assert!(repo.contains(" noble stable"), "{}", repo);
    }

    #[test]
    fn test_unknown_action_is_invalid_task() {
        let mut play = Play::new("p", "all");
        play.entries.push(PlayEntry::Task(Task::new("frobnicate", "frob")));
        let err = play
            .resolve(
                &RoleLibrary::new(),
                &ModuleRegistry::with_builtins(),
                &Vars::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTask { .. }));
    }

    #[test]
    fn test_hosts_substitution() {
        let mut play = Play::new("p", "{{ target }}");
        play.vars = vars(json!({"target": "web"}));
        let resolved = play
            .resolve(&RoleLibrary::new(), &ModuleRegistry::with_builtins(), &Vars::new())
            .unwrap();
        assert_eq!(resolved.hosts, "web");
    }
}
