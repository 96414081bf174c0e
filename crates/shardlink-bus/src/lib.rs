//! Message bus transport for shardlink.
//!
//! This crate provides:
//! - A [`Broker`] abstraction with AMQP-style exchanges, queues, and settlement
//! - An in-process broker and a NATS-backed broker
//! - The per-instance bus topology
//! - A shared publisher with configurable back-pressure
//! - Typed request/response with correlation

pub mod broker;
pub mod error;
pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
pub mod publisher;
pub mod rpc;
pub mod topology;

pub use broker::{Broker, BusMessage, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec, QueueSpec};
pub use error::BusError;
pub use memory::MemoryBroker;
pub use publisher::BusPublisher;
pub use rpc::{BusRpc, HandlerRegistry, Reply, RpcOptions};
pub use topology::Topology;

use std::sync::Arc;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Open a broker for `url`.
///
/// `memory://` gives an in-process broker; `nats://` connects to a NATS server
/// when the `nats` feature is enabled.
pub async fn connect(url: &str) -> Result<Arc<dyn Broker>> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryBroker::new()));
    }

    #[cfg(feature = "nats")]
    if url.starts_with("nats://") || url.starts_with("tls://") {
        return Ok(Arc::new(nats::NatsBroker::connect(url).await?));
    }

    Err(BusError::UnsupportedUrl(url.to_string()))
}
