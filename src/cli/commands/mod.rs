//! Subcommands module for Homestead CLI
//!
//! This module contains all the subcommand implementations.

pub mod list_hosts;
pub mod run;
pub mod validate;

use crate::cli::output::OutputFormatter;
use homestead::config::Config;
use homestead::inventory::Inventory;
use homestead::roles::RoleLibrary;
use homestead::vars::Vars;
use homestead::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration, with command-line overrides applied by each command
    pub config: Config,
    /// Output formatter
    pub output: Arc<OutputFormatter>,
    /// Verbosity level
    pub verbosity: u8,
    /// Cancelled on Ctrl-C
    pub cancel: CancellationToken,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &crate::cli::Cli, config: Config, cancel: CancellationToken) -> Self {
        let json_mode = cli.output.unwrap_or(config.output.format)
            == homestead::config::OutputFormat::Json;
        let use_color = config.output.color && !cli.no_color;
        let output = OutputFormatter::new(use_color, json_mode, cli.verbosity());

        Self {
            config,
            output: Arc::new(output),
            verbosity: cli.verbosity(),
            cancel,
        }
    }

    /// Get the effective inventory path
    pub fn inventory_path<'a>(&'a self, explicit: Option<&'a PathBuf>) -> Option<&'a PathBuf> {
        explicit.or(self.config.defaults.inventory.as_ref())
    }

    /// Load the inventory named on the command line or in the configuration
    pub fn load_inventory(&self, explicit: Option<&PathBuf>) -> Result<Inventory> {
        let path = self.inventory_path(explicit).ok_or_else(|| {
            Error::Config("no inventory given; pass -i or set defaults.inventory".to_string())
        })?;
        Ok(Inventory::load(path)?)
    }

    /// Role library searching `<playbook dir>/roles` first, then the
    /// command-line or configured roles path, then the built-in roles.
    pub fn role_library(&self, playbook: &Path, roles_path: &[PathBuf]) -> RoleLibrary {
        let mut library = RoleLibrary::with_builtins();
        if let Some(dir) = playbook.parent() {
            let dir = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            library.add_search_path(dir.join("roles"));
        }

        let configured = if roles_path.is_empty() {
            &self.config.defaults.roles_path
        } else {
            roles_path
        };
        for dir in configured {
            if !library.search_paths().contains(dir) {
                library.add_search_path(dir.clone());
            }
        }
        library
    }
}

/// Parse `-e` arguments into variables.
///
/// Each argument is either `key=value`, where the value is read as a YAML
/// scalar and falls back to a plain string, or `@file` naming a YAML or
/// JSON mapping. Later arguments override earlier ones.
pub fn parse_extra_vars(args: &[String]) -> Result<Vars> {
    let mut vars = Vars::new();

    for arg in args {
        if let Some(file_path) = arg.strip_prefix('@') {
            let path = Path::new(file_path);
            if !path.is_file() {
                return Err(Error::FileNotFound(path.to_path_buf()));
            }
            let content = std::fs::read_to_string(path)?;
            let file_vars: Option<Vars> =
                serde_yaml::from_str(&content).map_err(|e| Error::yaml(file_path, &e))?;
            vars.extend(file_vars.unwrap_or_default());
        } else if let Some((key, value)) = arg.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::Config(format!("extra variable '{}' has no name", arg)));
            }
            let parsed = serde_yaml::from_str::<Value>(value)
                .ok()
                .filter(|v| !v.is_null() || value.trim() == "null")
                .unwrap_or_else(|| Value::String(value.to_string()));
            vars.insert(key.to_string(), parsed);
        } else {
            return Err(Error::Config(format!(
                "extra variable '{}' must be key=value or @file",
                arg
            )));
        }
    }

    Ok(vars)
}
