//! shardlink CLI entry point.

use clap::Parser;
use shardlink_cli::{init_tracing, load_config, resolve_config_path, run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A broken config file is reported by the command itself.
    let path = resolve_config_path(cli.config.as_deref())?;
    let logging = load_config(&path)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_tracing(cli.verbose, &logging)?;

    run(cli, path).await
}
