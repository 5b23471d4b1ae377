//! Configuration module for Homestead
//!
//! Handles loading and merging configuration from multiple sources, lowest
//! precedence first:
//! - Default values
//! - System configuration (`/etc/homestead/homestead.toml`)
//! - User configuration (`<config dir>/homestead/homestead.toml`)
//! - Project configuration (`./homestead.toml`)
//! - The file named by `HOMESTEAD_CONFIG`
//! - The file passed with `--config`
//! - `HOMESTEAD_*` environment variables
//!
//! Command-line flags are applied last by the CLI. Files may be TOML, YAML
//! or JSON, chosen by extension. Each file only needs the keys it changes;
//! files are merged key by key before the result is deserialized.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::SshSettings;
use crate::error::{Error, Result};
use crate::executor::{ExecutorConfig, DEFAULT_FORKS};
use crate::retry::RetryPolicy;

/// Environment variable naming an extra configuration file.
pub const CONFIG_ENV: &str = "HOMESTEAD_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default settings
    pub defaults: Defaults,

    /// Timeouts
    pub timeouts: Timeouts,

    /// Connection retries
    pub retry: RetryPolicy,

    /// SSH settings
    pub ssh: SshSettings,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Output settings
    pub output: OutputConfig,
}

/// Default configuration values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Default inventory path
    pub inventory: Option<PathBuf>,

    /// Number of nodes worked on in parallel
    pub forks: usize,

    /// Directories searched for roles, in order
    pub roles_path: Vec<PathBuf>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            inventory: None,
            forks: DEFAULT_FORKS,
            roles_path: vec![PathBuf::from("./roles")],
        }
    }
}

/// Connection and task timeouts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Timeout of each connection attempt
    #[serde(with = "humantime_serde")]
    pub connect: Duration,

    /// Timeout of a whole task
    #[serde(with = "humantime_serde")]
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            command: Duration::from_secs(300),
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `-v` and `RUST_LOG`
    pub level: String,

    /// Log line format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Report format on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

/// Output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Colored human output
    pub color: bool,

    /// Report format
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            color: true,
            format: OutputFormat::Human,
        }
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut merged = Value::Object(serde_json::Map::new());

        for path in Self::config_paths(config_path) {
            if path.is_file() {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                merge_values(&mut merged, read_value(&path)?);
            } else if config_path == Some(path.as_path()) {
                return Err(Error::FileNotFound(path));
            }
        }

        let mut config: Config = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load from a single file on top of the defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        serde_json::from_value(read_value(path)?).map_err(|e| {
            Error::Config(format!("invalid configuration in {}: {}", path.display(), e))
        })
    }

    /// Configuration files to check, lowest precedence first
    fn config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/homestead/homestead.toml")];

        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("homestead").join("homestead.toml"));
        }

        paths.push(PathBuf::from("homestead.toml"));

        if let Ok(env_config) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(env_config));
        }

        if let Some(path) = explicit_path {
            paths.push(path.to_path_buf());
        }

        paths
    }

    /// Apply `HOMESTEAD_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(forks) = env_parse::<usize>("HOMESTEAD_FORKS")? {
            self.defaults.forks = forks;
        }

        if let Ok(inventory) = std::env::var("HOMESTEAD_INVENTORY") {
            self.defaults.inventory = Some(PathBuf::from(inventory));
        }

        if let Some(paths) = std::env::var_os("HOMESTEAD_ROLES_PATH") {
            self.defaults.roles_path = std::env::split_paths(&paths).collect();
        }

        if let Some(secs) = env_parse::<u64>("HOMESTEAD_TIMEOUT")? {
            self.timeouts.command = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("HOMESTEAD_CONNECT_TIMEOUT")? {
            self.timeouts.connect = Duration::from_secs(secs);
        }

        if let Some(retries) = env_parse::<u32>("HOMESTEAD_RETRIES")? {
            self.retry.max_retries = retries;
        }

        if let Ok(args) = std::env::var("HOMESTEAD_SSH_ARGS") {
            self.ssh.extra_args = shell_words::split(&args).map_err(|e| {
                Error::Config(format!("HOMESTEAD_SSH_ARGS: {}", e))
            })?;
        }

        if let Ok(format) = std::env::var("HOMESTEAD_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => {
                    return Err(Error::Config(format!(
                        "HOMESTEAD_LOG_FORMAT: expected text or json, found '{}'",
                        other
                    )))
                }
            };
        }

        if std::env::var_os("NO_COLOR").is_some() || std::env::var_os("HOMESTEAD_NO_COLOR").is_some() {
            self.output.color = false;
        }

        Ok(())
    }

    /// Executor settings derived from this configuration
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_forks(self.defaults.forks)
            .with_connect_timeout(self.timeouts.connect)
            .with_command_timeout(self.timeouts.command)
            .with_retry(self.retry.clone())
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

fn read_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let invalid = |e: &dyn std::fmt::Display| {
        Error::Config(format!("failed to parse {}: {}", path.display(), e))
    };

    let value = match extension {
        "yml" | "yaml" => serde_yaml::from_str::<Option<Value>>(&content)
            .map_err(|e| invalid(&e))?
            .unwrap_or(Value::Null),
        "json" => serde_json::from_str(&content).map_err(|e| invalid(&e))?,
        _ => {
            let table: toml::Value = toml::from_str(&content).map_err(|e| invalid(&e))?;
            serde_json::to_value(table)?
        }
    };

    match value {
        Value::Null => Ok(Value::Object(serde_json::Map::new())),
        Value::Object(_) => Ok(value),
        other => Err(Error::Config(format!(
            "{} must contain a mapping, found {}",
            path.display(),
            other
        ))),
    }
}

/// Merge `overlay` into `base`: mappings merge key by key, anything else
/// replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
