//! Error types for Homestead.
//!
//! Errors fall into the categories reported by [`Error::category`]:
//! load and variable errors abort a run before anything executes, while
//! connection and task execution errors are isolated to a single node and
//! end up as task records in the run report.

use std::path::PathBuf;
use thiserror::Error;

use crate::connection::ConnectionError;

/// Result type alias for Homestead operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes used by the CLI.
pub mod exit_code {
    /// Every node completed every play.
    pub const SUCCESS: i32 = 0;
    /// Unclassified error.
    pub const GENERIC: i32 = 1;
    /// At least one node failed.
    pub const NODES_FAILED: i32 = 2;
    /// Inventory, playbook or variable error before execution.
    pub const LOAD_ERROR: i32 = 4;
    /// The run was cancelled.
    pub const CANCELLED: i32 = 130;
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or inconsistent input. Fatal before execution.
    Load,
    /// Unresolvable variable reference. Fatal before execution.
    Variable,
    /// Transport failure. Retryable, then a node-level failure.
    Connection,
    /// A task failed on a node. Halts that node's play.
    TaskExecution,
    /// Configuration, IO and everything else.
    Other,
}

/// The main error type for Homestead.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Load Errors
    // ========================================================================
    /// Malformed inventory or playbook text.
    #[error("Failed to parse '{origin}': {message}")]
    Parse {
        /// File name or other description of the source text
        origin: String,
        /// Error message, including the location when known
        message: String,
    },

    /// Same node declared twice with conflicting connection parameters.
    #[error("Node '{name}' declared with conflicting connection parameters: {message}")]
    DuplicateNode {
        /// Node name
        name: String,
        /// Which parameter conflicts
        message: String,
    },

    /// Node has neither an explicit address nor a resolvable name.
    #[error("Node '{0}' has no connection address and its name is not a valid host name")]
    UnresolvableNode(String),

    /// Role reference that the role library cannot satisfy.
    #[error("Role '{role}' referenced by play '{play}' not found")]
    UnknownRole {
        /// Role name
        role: String,
        /// Play containing the reference
        play: String,
    },

    /// Task with an unknown action or invalid parameters.
    #[error("Invalid task '{task}': {message}")]
    InvalidTask {
        /// Task name
        task: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Variable Errors
    // ========================================================================
    /// Variable referenced but defined nowhere.
    #[error("Undefined variable '{variable}' in {context}")]
    MissingVariable {
        /// Variable name
        variable: String,
        /// Where the reference appeared
        context: String,
    },

    /// Variable values referencing each other too deeply.
    #[error("Variable '{0}' is recursively defined")]
    RecursiveVariable(String),

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Could not reach a node.
    #[error("Failed to connect to '{node}': {source}")]
    Connection {
        /// Node name
        node: String,
        /// Underlying transport error
        #[source]
        source: ConnectionError,
    },

    /// Task failed on a node.
    #[error("Task '{task}' failed on '{node}': {message}")]
    TaskFailed {
        /// Task name
        task: String,
        /// Node name
        node: String,
        /// Error message
        message: String,
    },

    /// Task ran longer than the command timeout.
    #[error("Task '{task}' timed out on '{node}' after {timeout_secs} seconds")]
    ExecutionTimeout {
        /// Task name
        task: String,
        /// Node name
        node: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ========================================================================
    // IO and Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Creates a new parse error.
    pub fn parse(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error from a YAML error, keeping its location.
    pub fn yaml(origin: impl Into<String>, err: &serde_yaml::Error) -> Self {
        let message = match err.location() {
            Some(loc) => format!("line {}, column {}: {}", loc.line(), loc.column(), err),
            None => err.to_string(),
        };
        Self::parse(origin, message)
    }

    /// Creates a new missing variable error.
    pub fn missing_variable(variable: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingVariable {
            variable: variable.into(),
            context: context.into(),
        }
    }

    /// Creates a new invalid task error.
    pub fn invalid_task(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTask {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Parse { .. }
            | Error::DuplicateNode { .. }
            | Error::UnresolvableNode(_)
            | Error::UnknownRole { .. }
            | Error::InvalidTask { .. }
            | Error::FileNotFound(_) => ErrorCategory::Load,
            Error::MissingVariable { .. } | Error::RecursiveVariable(_) => ErrorCategory::Variable,
            Error::Connection { .. } => ErrorCategory::Connection,
            Error::TaskFailed { .. } | Error::ExecutionTimeout { .. } => {
                ErrorCategory::TaskExecution
            }
            Error::Config(_) | Error::Io(_) | Error::Json(_) => ErrorCategory::Other,
        }
    }

    /// Returns true for errors that must abort a run before execution.
    pub fn is_fatal_before_execution(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Load | ErrorCategory::Variable
        )
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Load | ErrorCategory::Variable => exit_code::LOAD_ERROR,
            ErrorCategory::Connection | ErrorCategory::TaskExecution => exit_code::NODES_FAILED,
            ErrorCategory::Other => exit_code::GENERIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::parse("inv", "bad line").category(),
            ErrorCategory::Load
        );
        assert_eq!(
            Error::missing_variable("x", "task 'a'").category(),
            ErrorCategory::Variable
        );
        assert_eq!(
            Error::Connection {
                node: "srv1".into(),
                source: ConnectionError::Timeout(5),
            }
            .category(),
            ErrorCategory::Connection
        );
        assert_eq!(Error::Config("x".into()).category(), ErrorCategory::Other);
    }

    #[test]
    fn test_exit_codes_distinguish_load_from_execution() {
        let load = Error::UnknownRole {
            role: "docker".into(),
            play: "setup".into(),
        };
        let exec = Error::TaskFailed {
            task: "t".into(),
            node: "srv1".into(),
            message: "boom".into(),
        };
        assert_eq!(load.exit_code(), exit_code::LOAD_ERROR);
        assert_eq!(exec.exit_code(), exit_code::NODES_FAILED);
        assert!(load.is_fatal_before_execution());
        assert!(!exec.is_fatal_before_execution());
    }

    #[test]
    fn test_display() {
        let err = Error::missing_variable("docker_packages", "role 'docker'");
        assert_eq!(
            err.to_string(),
            "Undefined variable 'docker_packages' in role 'docker'"
        );
    }
}
