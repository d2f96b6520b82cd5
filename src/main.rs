use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use chaos_engine::config::{EngineConfig, LoggingConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "chaos-engine")]
#[command(version, about = "Drive chaos experiments through prepare, attack and recover phases")]
pub struct Cli {
    /// Config file (defaults to ./chaos-engine.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database; overrides [storage].database
    #[arg(long, global = true, env = "CHAOS_DATABASE")]
    pub database: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse a scene code and show its parts
    Scene { code: String },
    /// Run an experiment plan (JSON) to completion
    Run { plan: PathBuf },
    /// Ask a running experiment to stop; its recover stages still run
    Stop { id: i64 },
    /// Print the invocation records of an experiment as JSON
    Records { id: i64 },
    /// Show the resolved configuration
    Config,
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("chaos_engine=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter))
    };

    // stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            logging
                .json
                .then(|| fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!logging.json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let mut config = EngineConfig::resolve(cli.config.as_deref(), &cwd)?;
    if let Some(database) = &cli.database {
        config.storage.database = Some(database.clone());
    }
    init_logging(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Scene { code } => cmd::cmd_scene(code)?,
        Commands::Run { plan } => cmd::cmd_run(&config, plan).await?,
        Commands::Stop { id } => cmd::cmd_stop(&config, *id).await?,
        Commands::Records { id } => cmd::cmd_records(&config, *id).await?,
        Commands::Config => cmd::cmd_config(&config)?,
    }

    Ok(())
}
