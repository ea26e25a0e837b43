//! Shipyard CLI tool.

use clap::{Parser, Subcommand};
use shipyard_config::SystemConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Shipyard job orchestrator", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "SHIPYARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of jobs from a run file
    Run {
        /// JSON file holding the run context and its jobs
        #[arg(long)]
        jobs: PathBuf,
        /// Maximum number of jobs in flight
        #[arg(long, default_value = "4")]
        concurrency: usize,
        /// PostgreSQL connection string, overrides the config file
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        /// Keep job records in memory instead of PostgreSQL
        #[arg(long)]
        in_memory: bool,
    },
    /// Validate the system configuration
    ValidateConfig,
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => commands::load_config(path)?,
        None => SystemConfig::default(),
    };
    init_tracing(&config.log_level, cli.log_json);

    match cli.command {
        Commands::Run {
            jobs,
            concurrency,
            database_url,
            in_memory,
        } => {
            let options = commands::run::RunOptions {
                jobs,
                concurrency,
                database_url: database_url.or_else(|| config.database_url.clone()),
                in_memory,
            };
            commands::run::run(&config, options).await?;
        }
        Commands::ValidateConfig => {
            commands::validate(&config);
        }
    }

    Ok(())
}
