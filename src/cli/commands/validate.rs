//! Validate command - Check a playbook without contacting any node
//!
//! Loads the playbook, resolves roles and variables and validates every
//! task's parameters. With an inventory, also reports plays whose host
//! pattern selects no node.

use super::{parse_extra_vars, CommandContext};
use clap::Parser;
use homestead::modules::ModuleRegistry;
use homestead::playbook::PlaybookLoader;
use homestead::Result;
use std::path::PathBuf;

/// Arguments for the validate command
#[derive(Parser, Debug, Clone)]
pub struct ValidateArgs {
    /// Path to the playbook file
    #[arg(required = true)]
    pub playbook: PathBuf,

    /// Inventory file used to check host patterns
    #[arg(short = 'i', long)]
    pub inventory: Option<PathBuf>,

    /// Extra variables (key=value or @file)
    #[arg(short = 'e', long = "extra-vars", action = clap::ArgAction::Append)]
    pub extra_vars: Vec<String>,

    /// Additional role directories, searched in order
    #[arg(long, action = clap::ArgAction::Append)]
    pub roles_path: Vec<PathBuf>,
}

impl ValidateArgs {
    /// Execute the validate command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let extra_vars = parse_extra_vars(&self.extra_vars)?;
        let library = ctx.role_library(&self.playbook, &self.roles_path);
        let playbook = PlaybookLoader::new(&library).load(&self.playbook)?;
        let plays = playbook.resolve(&library, &ModuleRegistry::with_builtins(), &extra_vars)?;

        let inventory = match ctx.inventory_path(self.inventory.as_ref()) {
            Some(_) => Some(ctx.load_inventory(self.inventory.as_ref())?),
            None => None,
        };

        let mut summary = Vec::new();
        for play in &plays {
            let targets = inventory
                .as_ref()
                .map(|inv| inv.select(&play.hosts).len());
            if targets == Some(0) {
                ctx.output.warning(&format!(
                    "play '{}' pattern '{}' matches no nodes",
                    play.name, play.hosts
                ));
            }

            ctx.output.line(&format!(
                "play '{}' (hosts: {}): {} task(s){}",
                play.name,
                play.hosts,
                play.tasks.len(),
                targets
                    .map(|n| format!(", {} node(s)", n))
                    .unwrap_or_default()
            ));
            if ctx.verbosity >= 1 {
                for task in play.tasks.iter() {
                    ctx.output
                        .line(&format!("  - {} [{}]", task.display_name(), task.action));
                }
            }

            summary.push(serde_json::json!({
                "name": play.name,
                "hosts": play.hosts,
                "tasks": play.tasks.iter().map(|t| t.display_name()).collect::<Vec<_>>(),
                "nodes": targets,
            }));
        }

        if ctx.output.is_json() {
            let doc = serde_json::json!({
                "playbook": playbook.name,
                "valid": true,
                "plays": summary,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        } else {
            ctx.output
                .line(&format!("Playbook '{}' is valid.", playbook.name));
        }

        Ok(0)
    }
}
