//! Configuration management commands.

use crate::load_config;
use clap::Args;
use shardlink_core::config::Config;
use std::path::Path;

/// Config command arguments.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(clap::Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,

    /// Get a configuration value
    Get {
        /// Configuration key (dot-separated path)
        key: String,
    },

    /// Write a default configuration file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, config_path: &Path) -> anyhow::Result<()> {
    match args.command {
        ConfigCommand::Show => {
            let config = load_config(config_path)?;
            println!("{}", serde_json::to_string_pretty(&redacted(&config)?)?);
        }

        ConfigCommand::Get { key } => {
            let config = load_config(config_path)?;
            let json = redacted(&config)?;

            match lookup(&json, &key) {
                Some(v) => println!("{}", serde_json::to_string_pretty(v)?),
                None => anyhow::bail!("Key not found: {}", key),
            }
        }

        ConfigCommand::Init { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {:?}. Use --force to overwrite.",
                    config_path
                );
            }

            Config::default().save(config_path)?;
            println!("Created config file: {:?}", config_path);
            println!("  Set server.password (or SHARDLINK_PASSWORD) before running the worker.");
        }

        ConfigCommand::Path => {
            println!("{}", config_path.display());
        }

        ConfigCommand::Validate => {
            let config = load_config(config_path)?;
            match config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => anyhow::bail!("Configuration error: {}", e),
            }
        }
    }

    Ok(())
}

/// Config as JSON with the shared secret masked.
fn redacted(config: &Config) -> anyhow::Result<serde_json::Value> {
    let mut json = serde_json::to_value(config)?;
    if !config.server.password.is_empty() {
        json["server"]["password"] = serde_json::Value::String("[REDACTED]".to_string());
    }
    Ok(json)
}

fn lookup<'a>(json: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    key.split('.').try_fold(json, |acc, k| acc.get(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlink_core::SecretString;

    #[test]
    fn test_dot_path_lookup() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(lookup(&json, "server.port").unwrap().as_u64(), Some(7440));
        assert_eq!(lookup(&json, "sessions.resume_timeout_secs").unwrap().as_u64(), Some(60));
        assert!(lookup(&json, "server.nope").is_none());
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = Config::default();
        config.server.password = SecretString::new("hunter2");
        let json = redacted(&config).unwrap();
        assert_eq!(json["server"]["password"], "[REDACTED]");
        assert!(!json.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_init_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardlink.json5");

        let init = |force| ConfigArgs {
            command: ConfigCommand::Init { force },
        };
        run(init(false), &path).await.unwrap();
        assert!(Config::load(&path).is_ok());
        assert!(run(init(false), &path).await.is_err());
        run(init(true), &path).await.unwrap();
    }
}
