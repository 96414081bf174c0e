//! Configuration schema definitions.

use crate::secret::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main shardlink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker identity.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Socket server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Resumable session settings.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Message bus settings.
    #[serde(default)]
    pub bus: BusConfig,

    /// Guild subscription retry settings.
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker identity section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix of the generated routing key.
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,

    /// Fixed routing key; generated from the prefix when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            instance_prefix: default_instance_prefix(),
            routing_key: None,
        }
    }
}

fn default_instance_prefix() -> String {
    "worker".to_string()
}

/// Socket server section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind mode.
    #[serde(default)]
    pub bind: BindMode,

    /// Port number.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket upgrade path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Shared secret coordinators present in `Authorization`.
    #[serde(default)]
    pub password: SecretString,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: BindMode::default(),
            port: default_port(),
            path: default_path(),
            password: SecretString::default(),
        }
    }
}

fn default_port() -> u16 {
    7440
}

fn default_path() -> String {
    "/ws".to_string()
}

/// Bind mode for the socket server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    /// Bind to loopback only (127.0.0.1).
    #[default]
    Loopback,

    /// Bind to all interfaces.
    Lan,
}

/// Resumable session section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Default seconds a paused session waits for a resume.
    #[serde(default = "default_resume_timeout_secs")]
    pub resume_timeout_secs: u64,

    /// Cap on frames buffered while paused; unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffered_frames: Option<usize>,

    /// What to do when the buffer cap is hit.
    #[serde(default)]
    pub overflow: BufferOverflow,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            resume_timeout_secs: default_resume_timeout_secs(),
            max_buffered_frames: None,
            overflow: BufferOverflow::default(),
        }
    }
}

fn default_resume_timeout_secs() -> u64 {
    60
}

/// Overflow policy for a paused session's replay buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferOverflow {
    /// Discard the oldest buffered frame to make room.
    #[default]
    DropOldest,

    /// Give up on the session and close it.
    Expire,
}

/// Message bus section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Whether the bus transport is started.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Broker URL; `memory://` runs an in-process broker.
    #[serde(default = "default_bus_url")]
    pub url: String,

    /// Deliveries handled concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Outbound publisher back-pressure.
    #[serde(default)]
    pub backpressure: Backpressure,

    /// Seconds a bus request waits for its reply.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_bus_url(),
            max_concurrency: default_max_concurrency(),
            backpressure: Backpressure::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bus_url() -> String {
    "memory://".to_string()
}

fn default_max_concurrency() -> usize {
    16
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Back-pressure policy of the shared bus publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum Backpressure {
    /// Queue without limit; publish failures are logged.
    #[default]
    Unbounded,

    /// Bounded queue; publishers wait for room.
    Block { capacity: usize },

    /// Bounded queue; messages that do not fit are dropped and logged.
    DropNewest { capacity: usize },
}

/// Guild subscription retry section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    /// Seconds between retry sweeps.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Sweeps an entry may wait before eviction; unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: default_retry_interval_secs(),
            max_attempts: None,
        }
    }
}

fn default_retry_interval_secs() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default)]
    pub level: LogLevel,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Log file path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for the shardlink crates at this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "shardlink=trace",
            Self::Debug => "shardlink=debug",
            Self::Info => "shardlink=info",
            Self::Warn => "shardlink=warn",
            Self::Error => "shardlink=error",
        }
    }
}
