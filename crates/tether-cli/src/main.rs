//! Tether CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tether_cli::{cli::Cli, commands::CommandDispatcher, config::CliAppConfig, config::LogConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CliAppConfig::load(&cli).context("Failed to load configuration")?;
    setup_logging(&config.log);
    debug!(?config, "Configuration loaded");

    CommandDispatcher::execute(cli.command, config)
        .await
        .context("Command failed")?;
    Ok(())
}

/// Setup logging; `RUST_LOG` wins over the configured filter
fn setup_logging(log: &LogConfig) {
    let default_directive = match (&log.filter, log.verbose) {
        (Some(filter), _) => filter.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => "info".to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
