//! Module system for Homestead
//!
//! A module implements one action (`package`, `file`, ...). Execution is
//! split in two halves:
//!
//! - [`Module::plan`] observes the node, compares it with the desired state
//!   and returns a [`Plan`]. A plan without a [`Mutation`] means the node is
//!   already in the desired state.
//! - [`apply`] performs the mutation's steps in order.
//!
//! Check mode only runs the first half.

pub mod apt_repository;
pub mod command;
pub mod copy;
pub mod file;
pub mod lineinfile;
pub mod package;
pub mod service;
pub mod user;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::connection::{Connection, ConnectionError, ExecuteOptions, TransferOptions};
use crate::vars::Vars;

/// Parameters passed to a module
pub type ModuleParams = Vars;

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Result type for module operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Per-task execution context
#[derive(Debug, Clone, Default)]
pub struct ModuleContext {
    /// Run commands and writes with privilege escalation
    pub r#become: bool,
    /// User to escalate to (default: root)
    pub become_user: Option<String>,
}

impl ModuleContext {
    /// Create a context without escalation
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable escalation
    pub fn with_become(mut self, r#become: bool) -> Self {
        self.r#become = r#become;
        self
    }

    /// Execute options reflecting the context
    pub fn exec_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            escalate: self.r#become,
            escalate_user: self.become_user.clone(),
            ..Default::default()
        }
    }

    /// Options for reading or inspecting files under the context
    pub fn read_options(&self) -> TransferOptions {
        TransferOptions {
            escalate: self.r#become,
            escalate_user: self.become_user.clone(),
            ..Default::default()
        }
    }

    /// Transfer options reflecting the context
    pub fn transfer_options(&self, mode: Option<u32>) -> TransferOptions {
        TransferOptions {
            mode,
            create_dirs: true,
            escalate: self.r#become,
            escalate_user: self.become_user.clone(),
        }
    }
}

/// A single step of a mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Run a shell command, failing on a non-zero exit code
    Run {
        /// Human readable summary
        description: String,
        /// Shell command line
        command: String,
    },
    /// Write a file
    Write {
        /// Destination path
        path: PathBuf,
        /// File content
        #[serde(serialize_with = "serialize_lossy")]
        content: Vec<u8>,
        /// File mode
        mode: Option<u32>,
    },
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

impl Step {
    /// Create a command step
    pub fn run(description: impl Into<String>, command: impl Into<String>) -> Self {
        Step::Run {
            description: description.into(),
            command: command.into(),
        }
    }

    /// Create a file write step
    pub fn write(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>, mode: Option<u32>) -> Self {
        Step::Write {
            path: path.into(),
            content: content.into(),
            mode,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Run { description, .. } => write!(f, "{}", description),
            Step::Write { path, .. } => write!(f, "write {}", path.display()),
        }
    }
}

/// Ordered steps that bring a node to the desired state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mutation {
    pub steps: Vec<Step>,
}

impl Mutation {
    /// Create a mutation from steps
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// One-line summary of the steps
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of the observe/compare half of a module
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Diagnostic message
    pub msg: String,
    /// Work to do, `None` when already converged
    pub mutation: Option<Mutation>,
}

impl Plan {
    /// The node already matches the desired state
    pub fn unchanged(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            mutation: None,
        }
    }

    /// The node needs `steps` to reach the desired state.
    ///
    /// An empty step list is treated as converged.
    pub fn change(msg: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            msg: msg.into(),
            mutation: (!steps.is_empty()).then(|| Mutation::new(steps)),
        }
    }

    /// Whether applying the plan would change the node
    pub fn is_change(&self) -> bool {
        self.mutation.is_some()
    }
}

/// Trait that all modules must implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns the action name of the module
    fn name(&self) -> &'static str;

    /// Returns a description of what the module does
    fn description(&self) -> &'static str;

    /// Returns the list of required parameters
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Validate parameter shapes before execution
    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let _ = params;
        Ok(())
    }

    /// Observe the node and plan the mutation needed, if any
    async fn plan(
        &self,
        connection: &dyn Connection,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<Plan>;
}

/// Perform a mutation's steps in order, stopping at the first failure.
pub async fn apply(
    connection: &dyn Connection,
    mutation: &Mutation,
    context: &ModuleContext,
) -> ModuleResult<()> {
    for step in &mutation.steps {
        debug!(node = %connection.identifier(), step = %step, "Applying step");
        match step {
            Step::Run { command, .. } => {
                run_checked(connection, command, context).await?;
            }
            Step::Write {
                path,
                content,
                mode,
            } => {
                connection
                    .upload_content(content, path, Some(context.transfer_options(*mode)))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Run a command and turn a non-zero exit into an error.
pub async fn run_checked(
    connection: &dyn Connection,
    command: &str,
    context: &ModuleContext,
) -> ModuleResult<String> {
    let result = connection
        .execute(command, Some(context.exec_options()))
        .await?;
    if result.success {
        Ok(result.stdout)
    } else {
        let message = if result.stderr.trim().is_empty() {
            result.stdout.trim().to_string()
        } else {
            result.stderr.trim().to_string()
        };
        Err(ModuleError::CommandFailed {
            code: result.exit_code,
            message,
        })
    }
}

/// Quote a value for the remote shell
pub(crate) fn quote(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

/// Helper trait for extracting parameters
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    fn get_bool_or(&self, key: &str, default: bool) -> ModuleResult<bool>;
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a string",
                key
            ))),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ModuleError::InvalidParameter(format!(
                    "{} must be a boolean",
                    key
                ))),
            },
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a boolean",
                key
            ))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> ModuleResult<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(Value::Array(arr)) => arr
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    _ => Err(ModuleError::InvalidParameter(format!(
                        "{} must be a list of strings",
                        key
                    ))),
                })
                .collect::<ModuleResult<Vec<_>>>()
                .map(Some),
            Some(Value::String(s)) => Ok(Some(
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }

    /// File modes are octal whether written as `"0644"` or `0644`.
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>> {
        let text = match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Null) | None => return Ok(None),
            Some(_) => {
                return Err(ModuleError::InvalidParameter(format!(
                    "{} must be an octal mode",
                    key
                )))
            }
        };
        u32::from_str_radix(text.trim_start_matches("0o"), 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .map(Some)
            .ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be an octal mode, found '{}'", key, text))
            })
    }
}

/// Parse a `state` parameter against the accepted values.
pub(crate) fn get_state<'a>(
    params: &ModuleParams,
    accepted: &[&'a str],
    default: &'a str,
) -> ModuleResult<&'a str> {
    match params.get_string("state")? {
        None => Ok(default),
        Some(state) => accepted
            .iter()
            .find(|s| **s == state.to_lowercase())
            .copied()
            .ok_or_else(|| {
                ModuleError::InvalidParameter(format!(
                    "Invalid state '{}'. Valid states: {}",
                    state,
                    accepted.join(", ")
                ))
            }),
    }
}

/// Registry for looking up modules by name
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with all built-in modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // Package management
        registry.register(Arc::new(package::PackageModule));
        registry.register(Arc::new(apt_repository::AptRepositoryModule));

        // Files
        registry.register(Arc::new(copy::CopyModule));
        registry.register(Arc::new(file::FileModule));
        registry.register(Arc::new(lineinfile::LineinfileModule));

        // System management
        registry.register(Arc::new(service::ServiceModule));
        registry.register(Arc::new(user::UserModule));

        // Guarded commands
        registry.register(Arc::new(command::CommandModule));
        registry
    }

    /// Register a module
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Get a module by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Check if a module exists
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Get all module names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check that `name` exists and accepts `params`
    pub fn validate(&self, name: &str, params: &ModuleParams) -> ModuleResult<()> {
        let module = self
            .get(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        for param in module.required_params() {
            if !params.contains_key(*param) {
                return Err(ModuleError::MissingParameter((*param).to_string()));
            }
        }
        module.validate_params(params)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
