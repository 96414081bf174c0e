//! Configuration loading and persistence.

use super::{Backpressure, Config};
use crate::env;
use crate::error::ConfigError;
use crate::id;
use crate::paths;
use crate::secret::SecretString;
use std::fs;
use std::path::Path;
use tracing::debug;

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = paths::config_file()?;
        Self::load(&path)
    }

    /// Load the default config file, falling back to defaults when it is missing or invalid.
    pub fn load_or_default() -> Self {
        match Self::load_default() {
            Ok(config) => config,
            Err(e) => {
                debug!("Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Json5(e.to_string()))
    }

    /// Save configuration to a file path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_json5()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Serialize to JSON5 string.
    pub fn to_json5(&self) -> Result<String, ConfigError> {
        // json5 has no serializer; JSON is valid JSON5
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `SHARDLINK_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(password) = env::get_var(env::PASSWORD_VAR) {
            self.server.password = SecretString::new(password);
        }
        if let Some(port) = env::get_u16(env::PORT_VAR) {
            self.server.port = port;
        }
        if let Some(url) = env::get_var(env::BUS_URL_VAR) {
            self.bus.url = url;
        }
        if let Some(key) = env::get_var(env::ROUTING_KEY_VAR) {
            self.worker.routing_key = Some(key);
        }
        if env::get_bool(env::NO_BUS_VAR) {
            self.bus.enabled = false;
        }
    }

    /// Routing key for this process: the configured one, or a fresh random one.
    pub fn resolve_routing_key(&self) -> String {
        self.worker
            .routing_key
            .clone()
            .unwrap_or_else(|| id::routing_key(&self.worker.instance_prefix))
    }

    /// Validate the configuration, collecting all errors before returning.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        // 1. Server
        if self.server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }
        if !self.server.path.starts_with('/') {
            errors.push(format!(
                "Server path '{}' must start with '/'",
                self.server.path
            ));
        }
        if self.server.password.is_empty() {
            errors.push("Server password must be set".to_string());
        }

        // 2. Worker identity
        if let Some(key) = &self.worker.routing_key {
            if !id::is_valid_routing_key(key) {
                errors.push(format!(
                    "Routing key '{}' may only contain letters, digits, '_' and '-'",
                    key
                ));
            }
        }

        // 3. Sessions
        if self.sessions.resume_timeout_secs == 0 {
            errors.push("Session resume timeout must be greater than 0".to_string());
        }
        if self.sessions.max_buffered_frames == Some(0) {
            errors.push("Session max_buffered_frames must be greater than 0 when set".to_string());
        }

        // 4. Bus
        if self.bus.enabled {
            if self.bus.max_concurrency == 0 {
                errors.push("Bus max_concurrency must be greater than 0".to_string());
            }
            if self.bus.request_timeout_secs == 0 {
                errors.push("Bus request timeout must be greater than 0".to_string());
            }
            if !self.bus.url.contains("://") {
                errors.push(format!("Bus URL '{}' is missing a scheme", self.bus.url));
            }
            match self.bus.backpressure {
                Backpressure::Block { capacity } | Backpressure::DropNewest { capacity }
                    if capacity == 0 =>
                {
                    errors.push("Bus back-pressure capacity must be greater than 0".to_string());
                }
                _ => {}
            }
        }

        // 5. Subscriptions
        if self.subscriptions.retry_interval_secs == 0 {
            errors.push("Subscription retry interval must be greater than 0".to_string());
        }
        if self.subscriptions.max_attempts == Some(0) {
            errors.push("Subscription max_attempts must be greater than 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }
}
