//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// converge - level-triggered reconciliation demo
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Run a reconcile loop against an in-memory cluster")]
#[command(
    long_about = "converge watches an in-memory collection of Deployments, keeps one Service per Deployment, and injects churn and sync failures so you can watch the queue, backoff and worker pool converge."
)]
pub struct Cli {
    /// Log filter (e.g. `info`, `converge_reconciler=debug`). Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controller until Ctrl+C or SIGTERM
    Run {
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of workers (overrides config and environment)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Seed for the churn simulator
        #[arg(long)]
        seed: Option<u64>,

        /// Milliseconds between simulated cluster changes
        #[arg(long, default_value_t = 500)]
        churn_interval_ms: u64,

        /// Probability that a Service write fails transiently
        #[arg(long, default_value_t = 0.1)]
        failure_rate: f64,
    },

    /// Print the effective configuration as JSON
    CheckConfig {
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "converge",
            "--log-level",
            "debug",
            "run",
            "--workers",
            "4",
            "--seed",
            "7",
        ]);
        assert!(cli.is_ok());
        let Ok(cli) = cli else { return };
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::Run {
                workers: Some(4),
                seed: Some(7),
                churn_interval_ms: 500,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_check_config() {
        let cli = Cli::try_parse_from(["converge", "check-config", "--config", "converge.toml"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::CheckConfig { config: Some(_) })
        ));
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
