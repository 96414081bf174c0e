//! shardlink command-line interface.

pub mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use shardlink_core::config::{Config, LoggingConfig};
use shardlink_core::paths;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// shardlink - resumable worker sessions and shard admission
#[derive(Parser)]
#[command(name = "shardlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to config file
    #[arg(short, long, env = "SHARDLINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run or inspect the worker
    Worker(commands::worker::WorkerArgs),

    /// Configuration management
    Config(commands::config::ConfigArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli, config_path: PathBuf) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => commands::worker::run(args, &config_path).await,
        Commands::Config(args) => commands::config::run(args, &config_path).await,
        Commands::Version => {
            println!("shardlink {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// The `--config` path, or the default location.
pub fn resolve_config_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(paths::expand_tilde(&path.to_string_lossy())),
        None => Ok(paths::config_file()?),
    }
}

/// Load the config file at `path` with environment overrides applied.
///
/// A missing file yields the defaults.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        Config::load(path).with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        debug!("No config file at {}, using defaults", path.display());
        Config::default()
    };
    config.apply_env();
    Ok(config)
}

/// Filter directive for `-v` count and the configured level.
pub fn log_directive(verbose: u8, logging: &LoggingConfig) -> &'static str {
    match verbose {
        0 => logging.level.directive(),
        1 => "shardlink=debug",
        _ => "shardlink=trace",
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the computed filter.
pub fn init_tracing(verbose: u8, logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_directive(verbose, logging)));

    let writer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let (json, plain) = if logging.json {
        (Some(fmt::layer().json().with_writer(writer)), None)
    } else {
        (None, Some(fmt::layer().with_writer(writer)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()?;
    Ok(())
}
