//! Binary entry-point for the tunnelgate forwarding proxy.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use tunnelgate::config::{self, Cli};
use tunnelgate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    let cfg = config::load_config(&cli.config)?;
    info!(config = ?cli.config, port = cfg.port, https = cfg.use_https, upstreams = cfg.upstreams.len(), "configuration loaded");

    if cli.dry_run {
        info!("dry run requested, configuration is valid, exiting without binding any sockets");
        return Ok(());
    }

    let orchestrator = Orchestrator::new(cfg);
    if let Err(e) = orchestrator.run().await {
        warn!(error = %e, "tunnelgate exited with error");
        return Err(e);
    }

    Ok(())
}
