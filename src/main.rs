//! Homestead - idempotent playbooks for homelab servers
//!
//! This is the main entry point for the Homestead CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use homestead::config::{Config, LogFormat};
use homestead::error::exit_code;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(exit_code::GENERIC);
        }
    };

    let log_format = cli.log_format.unwrap_or(config.logging.format);
    init_logging(cli.verbosity(), &config.logging.level, log_format);
    tracing::debug!(version = VERSION, "homestead starting");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            signal_token.cancel();
        }
    });

    let mut ctx = CommandContext::new(&cli, config, cancel);
    let code = match dispatch(&cli, &mut ctx).await {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            e.downcast_ref::<homestead::Error>()
                .map(homestead::Error::exit_code)
                .unwrap_or(exit_code::GENERIC)
        }
    };

    std::process::exit(code);
}

async fn dispatch(cli: &Cli, ctx: &mut CommandContext) -> Result<i32> {
    let code = match &cli.command {
        Commands::Run(args) => args.execute(ctx).await?,
        Commands::Validate(args) => args.execute(ctx).await?,
        Commands::ListHosts(args) => args.execute(ctx).await?,
    };
    Ok(code)
}

/// Initialize logging on stderr.
///
/// `-v` flags raise the configured level; `RUST_LOG` overrides both.
fn init_logging(verbosity: u8, configured: &str, format: LogFormat) {
    let filter = match verbosity {
        0 => configured,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbosity >= 3),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
