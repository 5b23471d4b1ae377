//! CLI module for Homestead
//!
//! This module provides the command-line interface for Homestead,
//! including argument parsing and subcommand handling.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use homestead::config::{LogFormat, OutputFormat};
use std::path::PathBuf;

/// Homestead - idempotent playbooks for homelab servers
#[derive(Parser, Debug, Clone)]
#[command(name = "homestead")]
#[command(author = "Homestead Contributors")]
#[command(version)]
#[command(about = "Apply idempotent playbooks to homelab servers", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true)]
    pub output: Option<OutputFormat>,

    /// Log format on stderr
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a playbook
    Run(commands::run::RunArgs),

    /// Load and resolve a playbook without contacting any node
    Validate(commands::validate::ValidateArgs),

    /// List the nodes matching a pattern
    #[command(name = "list-hosts")]
    ListHosts(commands::list_hosts::ListHostsArgs),
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_limit_is_forks() {
        let cli = Cli::try_parse_from([
            "homestead", "run", "site.yml", "-i", "hosts", "--limit", "3", "--check",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.forks, Some(3));
                assert!(args.check);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["homestead", "run", "site.yml", "-f", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Run(args) if args.forks == Some(7)));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "homestead", "list-hosts", "-i", "hosts", "web", "-vv", "--output", "json",
        ])
        .unwrap();
        assert_eq!(cli.verbosity(), 2);
        assert_eq!(cli.output, Some(OutputFormat::Json));
    }
}
