//! List-hosts command - Show which nodes a pattern selects

use super::CommandContext;
use clap::Parser;
use homestead::Result;
use std::path::PathBuf;

/// Arguments for the list-hosts command
#[derive(Parser, Debug, Clone)]
pub struct ListHostsArgs {
    /// Host pattern (group, node, glob or a:b union)
    #[arg(default_value = "all")]
    pub pattern: String,

    /// Inventory file (INI or YAML)
    #[arg(short = 'i', long)]
    pub inventory: Option<PathBuf>,
}

impl ListHostsArgs {
    /// Execute the list-hosts command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let inventory = ctx.load_inventory(self.inventory.as_ref())?;
        let nodes = inventory.select(&self.pattern);

        if ctx.output.is_json() {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            return Ok(0);
        }

        ctx.output.line(&format!(
            "  hosts ({}) matching '{}':",
            nodes.len(),
            self.pattern
        ));
        for node in &nodes {
            if ctx.verbosity >= 1 {
                ctx.output.line(&format!(
                    "    {} ({}:{}, {})",
                    node.name,
                    node.connect_address(),
                    node.port,
                    node.transport
                ));
            } else {
                ctx.output.line(&format!("    {}", node.name));
            }
        }
        Ok(0)
    }
}
