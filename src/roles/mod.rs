//! Roles: reusable, parameterized bundles of tasks.
//!
//! A role is an ordered task list plus default variables. Roles come from
//! the built-in set compiled into the binary or from role directories on
//! the search path:
//!
//! ```text
//! <roles-path>/<role>/tasks/main.yml      # required
//! <roles-path>/<role>/defaults/main.yml   # optional
//! ```
//!
//! A role found on the search path shadows a built-in role of the same name.

mod builtin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::playbook::task::{Task, TaskEntry};
use crate::vars::{VarScope, Vars};

/// A role containing reusable automation
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Ordered tasks, still containing variable references
    pub tasks: Vec<Task>,
    /// Default variable values
    pub defaults: Vars,
    /// Role directory, `None` for built-in roles
    pub path: Option<PathBuf>,
}

impl Role {
    /// Parses a role from its task list and optional defaults.
    pub fn from_yaml(
        name: impl Into<String>,
        tasks_yaml: &str,
        defaults_yaml: Option<&str>,
        origin: &str,
    ) -> Result<Self> {
        let name = name.into();

        let entries: Vec<TaskEntry> = if tasks_yaml.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str::<Option<Vec<TaskEntry>>>(tasks_yaml)
                .map_err(|e| Error::yaml(origin, &e))?
                .unwrap_or_default()
        };

        let mut tasks = Vec::with_capacity(entries.len());
        for entry in &entries {
            if entry.contains_key("role") || entry.contains_key("include_role") {
                return Err(Error::parse(
                    origin,
                    format!("role '{}' cannot include other roles", name),
                ));
            }
            let mut task = Task::from_entry(entry, origin)?;
            task.role = Some(name.clone());
            tasks.push(task);
        }

        let defaults = match defaults_yaml {
            Some(text) if !text.trim().is_empty() => {
                let defaults_origin = format!("defaults of role '{}'", name);
                serde_yaml::from_str::<Option<Vars>>(text)
                    .map_err(|e| Error::yaml(defaults_origin, &e))?
                    .unwrap_or_default()
            }
            _ => Vars::new(),
        };

        Ok(Self {
            name,
            tasks,
            defaults,
            path: None,
        })
    }

    /// Loads a role from its directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::FileNotFound(dir.to_path_buf()))?;

        let tasks_path = dir.join("tasks").join("main.yml");
        let tasks_yaml = std::fs::read_to_string(&tasks_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(tasks_path.clone()),
            _ => Error::Io(e),
        })?;

        let defaults_path = dir.join("defaults").join("main.yml");
        let defaults_yaml = if defaults_path.is_file() {
            Some(std::fs::read_to_string(&defaults_path)?)
        } else {
            None
        };

        let mut role = Self::from_yaml(
            name,
            &tasks_yaml,
            defaults_yaml.as_deref(),
            &tasks_path.display().to_string(),
        )?;
        role.path = Some(dir.to_path_buf());
        Ok(role)
    }

    /// Returns the role's tasks with every reference substituted.
    ///
    /// A name is looked up in `overrides` first and in the role defaults
    /// second. A name found in neither is a missing variable error.
    pub fn resolve(&self, overrides: &Vars) -> Result<Vec<Task>> {
        let scope = VarScope::new().layer(overrides).layer(&self.defaults);
        self.tasks
            .iter()
            .map(|task| task.substituted(&scope))
            .collect()
    }
}

/// Built-in roles plus role directories on the search path.
#[derive(Debug, Clone, Default)]
pub struct RoleLibrary {
    builtins: IndexMap<String, Arc<Role>>,
    search_paths: Vec<PathBuf>,
}

impl RoleLibrary {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a library holding the built-in roles.
    pub fn with_builtins() -> Self {
        let mut library = Self::new();
        for role in builtin::roles() {
            library.register(role);
        }
        library
    }

    /// Registers a role under its own name.
    pub fn register(&mut self, role: Role) {
        self.builtins.insert(role.name.clone(), Arc::new(role));
    }

    /// Appends a directory to the search path.
    pub fn add_search_path(&mut self, dir: impl Into<PathBuf>) {
        self.search_paths.push(dir.into());
    }

    /// Adds search paths in order.
    pub fn with_search_paths<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for dir in dirs {
            self.add_search_path(dir);
        }
        self
    }

    /// Search path, in lookup order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Finds a role by name.
    ///
    /// Returns `Ok(None)` when no search path directory and no built-in
    /// role provides it, and an error when a role directory exists but
    /// cannot be loaded.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<Role>>> {
        for dir in &self.search_paths {
            let candidate = dir.join(name);
            if candidate.join("tasks").join("main.yml").is_file() {
                debug!(role = name, path = %candidate.display(), "Loading role from search path");
                return Role::load(&candidate).map(|role| Some(Arc::new(role)));
            }
        }
        Ok(self.builtins.get(name).cloned())
    }

    /// Names of the built-in roles.
    pub fn builtin_names(&self) -> Vec<&str> {
        self.builtins.keys().map(String::as_str).collect()
    }
}
