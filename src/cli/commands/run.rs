//! Run command - Execute a playbook
//!
//! This module implements the `run` subcommand: load the inventory and the
//! playbook, resolve roles and variables, then apply every play.

use super::{parse_extra_vars, CommandContext};
use clap::Parser;
use homestead::connection::TransportConnector;
use homestead::executor::{RunCoordinator, TaskExecutor};
use homestead::modules::ModuleRegistry;
use homestead::playbook::PlaybookLoader;
use homestead::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Arguments for the run command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the playbook file
    #[arg(required = true)]
    pub playbook: PathBuf,

    /// Inventory file (INI or YAML)
    #[arg(short = 'i', long)]
    pub inventory: Option<PathBuf>,

    /// Maximum number of nodes worked on at once
    #[arg(short = 'f', long = "limit", visible_alias = "forks")]
    pub forks: Option<usize>,

    /// Report what would change without changing anything
    #[arg(short = 'C', long = "check")]
    pub check: bool,

    /// Extra variables (key=value or @file), highest precedence
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Additional role directories, searched in order
    #[arg(long, action = clap::ArgAction::Append)]
    pub roles_path: Vec<PathBuf>,

    /// Timeout of a whole task, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Timeout of each connection attempt, in seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Connection retries after the first attempt
    #[arg(long)]
    pub retries: Option<u32>,

    /// Write the JSON run report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl RunArgs {
    /// Execute the run command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        self.apply_overrides(ctx);

        let extra_vars = parse_extra_vars(&self.extra_vars)?;
        let inventory = ctx.load_inventory(self.inventory.as_ref())?;
        let library = ctx.role_library(&self.playbook, &self.roles_path);
        let playbook = PlaybookLoader::new(&library).load(&self.playbook)?;

        info!(
            playbook = %playbook.name,
            plays = playbook.play_count(),
            nodes = inventory.node_count(),
            check_mode = self.check,
            "Starting run"
        );
        if self.check {
            ctx.output
                .warning("Running in CHECK MODE - no changes will be made");
        }

        let executor = TaskExecutor::new(
            Arc::new(TransportConnector::new(ctx.config.ssh.clone())),
            Arc::new(ModuleRegistry::with_builtins()),
            ctx.config.executor_config().with_check_mode(self.check),
        );
        let coordinator = RunCoordinator::new(executor, library)
            .with_extra_vars(extra_vars)
            .with_callback(ctx.output.clone())
            .with_cancellation(ctx.cancel.clone());

        let report = coordinator.run(&playbook, &inventory).await?;

        if ctx.output.is_json() {
            println!("{}", report.to_json()?);
        }
        if let Some(path) = &self.report {
            report.write_json(path)?;
            info!(path = %path.display(), "Wrote run report");
        }

        Ok(report.exit_code())
    }

    /// Command-line flags take precedence over every configuration source
    fn apply_overrides(&self, ctx: &mut CommandContext) {
        let config = &mut ctx.config;
        if let Some(forks) = self.forks {
            config.defaults.forks = forks;
        }
        if let Some(secs) = self.timeout {
            config.timeouts.command = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout {
            config.timeouts.connect = Duration::from_secs(secs);
        }
        if let Some(retries) = self.retries {
            config.retry.max_retries = retries;
        }
    }
}
