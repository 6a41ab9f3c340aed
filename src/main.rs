//! # converge
//!
//! Runs the reconcile loop against an in-memory cluster.
//!
//! Startup order:
//!
//! 1. **Tracing**: `--log-level` or `RUST_LOG`, defaulting to `info`
//! 2. **Config**: TOML file (optional), then `CONVERGE_*` overrides, then flags
//! 3. **Signals**: SIGTERM/SIGINT initiate shutdown through the coordinator
//! 4. **Controller**: waits for the cache to sync, then starts the workers

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod demo;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use converge_core::{ShutdownCoordinator, install_signal_handlers};
use converge_reconciler::ControllerConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands};
use crate::demo::DemoOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;

    match cli.command {
        Commands::Run {
            config,
            workers,
            seed,
            churn_interval_ms,
            failure_rate,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(workers) = workers {
                config = config.workers(workers);
            }
            config.validate().context("Invalid configuration")?;

            let coordinator = Arc::new(ShutdownCoordinator::new());
            let _signals = install_signal_handlers(Arc::clone(&coordinator));

            let options = DemoOptions {
                seed: seed.unwrap_or_else(rand::random),
                churn_interval: Duration::from_millis(churn_interval_ms),
                failure_rate,
            };
            let totals = demo::run(config, options, coordinator).await?;
            info!(done = totals.done, terminal = totals.terminal, "converge stopped");
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            config.validate().context("Invalid configuration")?;
            let rendered =
                serde_json::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
        }
    }

    Ok(())
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).context("Invalid --log-level filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    config
        .with_env()
        .context("Failed to apply CONVERGE_* environment overrides")
}
