//! Worker command.

use crate::load_config;
use anyhow::Context;
use clap::Args;
use shardlink_core::config::{BindMode, Config};
use shardlink_core::SecretString;
use shardlink_worker::upstream::Detached;
use shardlink_worker::{HealthStatus, WorkerBuilder};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Worker command arguments.
#[derive(Args)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerCommand,
}

#[derive(clap::Subcommand)]
pub enum WorkerCommand {
    /// Start the worker
    Run(RunArgs),

    /// Show worker status
    Status,
}

/// Overrides for `worker run`. Unset flags keep the config file values.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Bind mode (loopback, lan)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Port number
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Shared secret coordinators must present
    #[arg(long)]
    pub password: Option<String>,

    /// Message bus URL (memory://, nats://)
    #[arg(long)]
    pub bus_url: Option<String>,

    /// Run without the message bus
    #[arg(long)]
    pub no_bus: bool,
}

impl RunArgs {
    /// Apply the flags on top of `config`.
    pub fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(bind) = &self.bind {
            config.server.bind = match bind.as_str() {
                "loopback" => BindMode::Loopback,
                "lan" => BindMode::Lan,
                other => anyhow::bail!("Invalid bind mode: {}", other),
            };
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(password) = &self.password {
            config.server.password = SecretString::new(password.clone());
        }
        if let Some(url) = &self.bus_url {
            config.bus.url = url.clone();
        }
        if self.no_bus {
            config.bus.enabled = false;
        }
        Ok(())
    }
}

/// Run the worker command.
pub async fn run(args: WorkerArgs, config_path: &Path) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;

    match args.command {
        WorkerCommand::Run(overrides) => {
            overrides.apply(&mut config)?;
            config.validate().context("Invalid configuration")?;

            // No upstream library is linked into the binary; subscriptions stay deferred.
            let builder = WorkerBuilder::new(config, Arc::new(Detached::new(1)));
            let worker = builder.start().await?;
            info!(
                routing_key = %worker.routing_key(),
                "Worker listening on {}",
                worker.local_addr()
            );

            worker.run(shutdown_signal()).await?;
        }

        WorkerCommand::Status => {
            let url = format!("http://127.0.0.1:{}/health", config.server.port);
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()?;

            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let health: HealthStatus = response.json().await?;
                    println!("Worker is running on port {}", config.server.port);
                    println!("  Routing key: {}", health.routing_key);
                    println!("  Sessions:    {} ({} paused)", health.sessions, health.paused);
                    println!("  Queued:      {}", health.queued);
                }
                Ok(response) => {
                    println!("Worker answered with status {}", response.status());
                }
                Err(_) => {
                    println!("Worker is not running.");
                }
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
