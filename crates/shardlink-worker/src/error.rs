//! Worker error types.

use shardlink_bus::BusError;
use shardlink_core::error::PayloadError;
use shardlink_core::types::ShardId;
use thiserror::Error;

/// Errors that can occur in the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload could not be decoded.
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Handshake rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Frame the peer should not have sent.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Message for a session that does not exist.
    #[error("Unknown session: {0}")]
    State(String),

    /// Owning shard is not connected yet.
    #[error("Shard {0} is not ready")]
    UpstreamNotReady(ShardId),

    /// Run requested for a shard that is not queued.
    #[error("Shard {0} is not queued")]
    NotQueued(ShardId),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by an upstream shard handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The connection attempt failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The shard was shut down while waiting.
    #[error("shard closed")]
    Closed,
}
