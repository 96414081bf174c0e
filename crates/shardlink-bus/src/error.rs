//! Bus error types.

use shardlink_core::error::PayloadError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur on the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Broker connection failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker URL scheme is not supported by this build.
    #[error("Unsupported bus URL: {0}")]
    UnsupportedUrl(String),

    /// Exchange or queue redeclared with different properties.
    #[error("Topology error: {0}")]
    Topology(String),

    /// Publish to an exchange that was never declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consume or bind on a queue that was never declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Exclusive queue already has a consumer.
    #[error("Queue '{0}' already has a consumer")]
    ConsumerExists(String),

    /// Broker refused a publish.
    #[error("Publish error: {0}")]
    Publish(String),

    /// The publisher task is gone.
    #[error("Bus publisher closed")]
    Closed,

    /// Delivery arrived without a `type` header.
    #[error("Message has no type header")]
    MissingType,

    /// Payload could not be decoded.
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    /// Handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Request/reply contract broken.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No reply within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The responder reported a failure.
    #[error("Remote error: {0}")]
    Remote(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
