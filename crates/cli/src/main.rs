//! Model lifecycle CLI
//!
//! Operator tool for the retraining pipeline: run change detection, retrain
//! and promote, inspect the registry and check which model the prediction
//! server would load.

mod commands;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{models, pipeline};
use lifecycle_lib::LifecycleConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Model lifecycle CLI
#[derive(Debug, Parser)]
#[command(name = "lifecycle")]
#[command(author, version, about = "CLI for the model retraining and promotion pipeline", long_about = None)]
pub struct Cli {
    /// Config file (defaults to lifecycle.{toml,yaml,json} in the working directory)
    #[arg(long, short, global = true, env = "LIFECYCLE_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Detect changes, train every candidate and promote the best
    Retrain {
        /// Retrain even when the dataset is unchanged
        #[arg(long)]
        force: bool,
    },

    /// Report whether the dataset changed, without recording the new digest
    Check,

    /// Show which model the prediction server would load
    Resolve,

    /// List registered versions with their stage tags
    Versions,

    /// Move the active stage to an existing version
    Promote {
        /// Registered version number
        version: u64,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs go to stderr so JSON output stays machine-readable
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = LifecycleConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Retrain { force } => pipeline::retrain(config, force, cli.format).await,
        Commands::Check => pipeline::check(&config, cli.format),
        Commands::Resolve => models::resolve(&config, cli.format).await,
        Commands::Versions => models::versions(&config, cli.format).await,
        Commands::Promote { version } => models::promote(&config, version, cli.format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
