//! Task definitions and parsing of task entries.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::modules::{ModuleContext, ModuleParams};
use crate::vars::{substitute, VarScope, Vars};

/// Keys of a task entry that are not the action.
const TASK_KEYWORDS: &[&str] = &["name", "ignore_errors", "become", "become_user"];

/// Raw mapping as written in a playbook or role file.
pub(crate) type TaskEntry = IndexMap<String, Value>;

/// A task to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Name of the task
    pub name: String,

    /// Module to execute
    pub action: String,

    /// Module parameters
    #[serde(default)]
    pub params: ModuleParams,

    /// Record a failure without halting the node
    #[serde(default)]
    pub ignore_errors: bool,

    /// Privilege escalation, overriding the play setting
    #[serde(default, rename = "become", skip_serializing_if = "Option::is_none")]
    pub r#become: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    /// Role this task was expanded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Task {
    /// Creates a task running `action` with no parameters.
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: action.into(),
            params: ModuleParams::new(),
            ignore_errors: false,
            r#become: None,
            become_user: None,
            role: None,
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Marks the task as ignorable.
    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Name shown in output, prefixed with the role when there is one.
    pub fn display_name(&self) -> String {
        match &self.role {
            Some(role) => format!("{} : {}", role, self.name),
            None => self.name.clone(),
        }
    }

    /// Module context for this task under a play's escalation defaults.
    pub fn context(&self, play_become: bool, play_become_user: Option<&str>) -> ModuleContext {
        ModuleContext {
            r#become: self.r#become.unwrap_or(play_become),
            become_user: self
                .become_user
                .clone()
                .or_else(|| play_become_user.map(str::to_string)),
        }
    }

    /// Builds a task from a raw entry.
    ///
    /// The entry must have exactly one key that is not a task keyword; that
    /// key names the action and its value holds the parameters.
    pub(crate) fn from_entry(entry: &TaskEntry, origin: &str) -> Result<Self> {
        let actions: Vec<&String> = entry
            .keys()
            .filter(|key| !TASK_KEYWORDS.contains(&key.as_str()))
            .collect();

        let label = match entry.get("name") {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(Error::parse(
                    origin,
                    format!("task name must be a string, found {}", other),
                ))
            }
            None => actions
                .first()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<unnamed>".to_string()),
        };

        let action = match actions.as_slice() {
            [action] => (*action).clone(),
            [] => {
                return Err(Error::parse(
                    origin,
                    format!("task '{}' has no action", label),
                ))
            }
            many => {
                let names: Vec<&str> = many.iter().map(|a| a.as_str()).collect();
                return Err(Error::parse(
                    origin,
                    format!(
                        "task '{}' has more than one action: {}",
                        label,
                        names.join(", ")
                    ),
                ));
            }
        };

        let params = match &entry[&action] {
            Value::Null => ModuleParams::new(),
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Value::String(cmd) if action == "command" => {
                let mut params = ModuleParams::new();
                params.insert("cmd".to_string(), Value::String(cmd.clone()));
                params
            }
            other => {
                return Err(Error::parse(
                    origin,
                    format!(
                        "parameters of task '{}' must be a mapping, found {}",
                        label, other
                    ),
                ))
            }
        };

        let flag = |key: &str| -> Result<Option<bool>> {
            match entry.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Bool(b)) => Ok(Some(*b)),
                Some(other) => Err(Error::parse(
                    origin,
                    format!("'{}' of task '{}' must be a boolean, found {}", key, label, other),
                )),
            }
        };

        let become_user = match entry.get("become_user") {
            None | Some(Value::Null) => None,
            Some(Value::String(user)) => Some(user.clone()),
            Some(other) => {
                return Err(Error::parse(
                    origin,
                    format!("become_user of task '{}' must be a string, found {}", label, other),
                ))
            }
        };

        let ignore_errors = flag("ignore_errors")?.unwrap_or(false);
        let r#become = flag("become")?;

        Ok(Self {
            name: label,
            action,
            params,
            ignore_errors,
            r#become,
            become_user,
            role: None,
        })
    }

    /// Returns a copy with every reference in the name and parameters
    /// substituted from `scope`.
    pub fn substituted(&self, scope: &VarScope<'_>) -> Result<Self> {
        let context = match &self.role {
            Some(role) => format!("task '{}' of role '{}'", self.name, role),
            None => format!("task '{}'", self.name),
        };

        let name = match substitute(&Value::String(self.name.clone()), scope, &context)? {
            Value::String(name) => name,
            other => crate::vars::render_text(&other),
        };

        let mut params = Vars::with_capacity(self.params.len());
        for (key, value) in &self.params {
            params.insert(key.clone(), substitute(value, scope, &context)?);
        }

        Ok(Self {
            name,
            params,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> TaskEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_from_entry() {
        let task = Task::from_entry(
            &entry(json!({
                "name": "install git",
                "package": {"name": "git", "state": "present"},
                "become": true,
                "ignore_errors": true
            })),
            "site.yml",
        )
        .unwrap();

        assert_eq!(task.name, "install git");
        assert_eq!(task.action, "package");
        assert_eq!(task.params["name"], json!("git"));
        assert_eq!(task.r#become, Some(true));
        assert!(task.ignore_errors);
    }

    #[test]
    fn test_non_boolean_flag_is_rejected() {
        let err = Task::from_entry(
            &entry(json!({"name": "svc", "service": {"name": "docker"}, "become": "yes"})),
            "site.yml",
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("'become' of task 'svc' must be a boolean"), "{}", err);
    }

    #[test]
    fn test_command_shorthand() {
        let task = Task::from_entry(
            &entry(json!({"name": "build", "command": "make"})),
            "site.yml",
        )
        .unwrap();
        assert_eq!(task.params["cmd"], json!("make"));
    }

    #[test]
    fn test_action_count() {
        let none = Task::from_entry(&entry(json!({"name": "nothing"})), "site.yml");
        assert!(matches!(none, Err(Error::Parse { .. })));

        let two = Task::from_entry(
            &entry(json!({"name": "two", "package": {}, "service": {}})),
            "site.yml",
        );
        let err = two.unwrap_err().to_string();
        assert!(err.contains("more than one action: package, service"), "{}", err);
    }

    #[test]
    fn test_unnamed_task_uses_action() {
        let task = Task::from_entry(&entry(json!({"file": {"path": "/srv", "state": "directory"}})), "x")
            .unwrap();
        assert_eq!(task.name, "file");
    }

    #[test]
    fn test_context_inherits_play() {
        let mut task = Task::new("t", "package");
        assert!(task.context(true, Some("root")).r#become);
        task.r#become = Some(false);
        let ctx = task.context(true, Some("root"));
        assert!(!ctx.r#become);
        assert_eq!(ctx.become_user.as_deref(), Some("root"));
    }

    #[test]
    fn test_substituted() {
        let task = Task::new("install {{ pkg }}", "package").with_param("name", "{{ pkg }}");
        let vars: Vars = serde_json::from_value(json!({"pkg": "htop"})).unwrap();
        let resolved = task.substituted(&VarScope::new().layer(&vars)).unwrap();
        assert_eq!(resolved.name, "install htop");
        assert_eq!(resolved.params["name"], json!("htop"));
    }
}
