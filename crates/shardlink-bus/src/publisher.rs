//! Shared outbound publisher.
//!
//! Every publish from this process goes through one task that owns the broker
//! sink, so messages leave in the order they were handed over. The channel
//! feeding that task follows the configured [`Backpressure`] policy.

use crate::broker::{Broker, BusMessage};
use crate::error::BusError;
use crate::Result;
use shardlink_core::config::Backpressure;
use shardlink_core::types::Payload;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct Outbound {
    exchange: String,
    routing_key: String,
    message: BusMessage,
}

#[derive(Clone)]
enum Sink {
    Unbounded(mpsc::UnboundedSender<Outbound>),
    Block(mpsc::Sender<Outbound>),
    DropNewest(mpsc::Sender<Outbound>),
}

/// Handle to the shared publisher task. Cheap to clone.
#[derive(Clone)]
pub struct BusPublisher {
    sink: Sink,
    dropped: Arc<AtomicU64>,
}

impl BusPublisher {
    /// Spawn the publisher task for `broker` with the given policy.
    pub fn spawn(broker: Arc<dyn Broker>, policy: Backpressure) -> (Self, JoinHandle<()>) {
        let (sink, task) = match policy {
            Backpressure::Unbounded => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
                let task = tokio::spawn(async move {
                    while let Some(outbound) = rx.recv().await {
                        forward(broker.as_ref(), outbound).await;
                    }
                });
                (Sink::Unbounded(tx), task)
            }
            Backpressure::Block { capacity } | Backpressure::DropNewest { capacity } => {
                let (tx, mut rx) = mpsc::channel::<Outbound>(capacity.max(1));
                let task = tokio::spawn(async move {
                    while let Some(outbound) = rx.recv().await {
                        forward(broker.as_ref(), outbound).await;
                    }
                });
                let sink = if matches!(policy, Backpressure::Block { .. }) {
                    Sink::Block(tx)
                } else {
                    Sink::DropNewest(tx)
                };
                (sink, task)
            }
        };

        let publisher = Self {
            sink,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (publisher, task)
    }

    /// Hand a message to the publisher task.
    ///
    /// Under `block` this waits for room; under `drop-newest` a full queue
    /// drops the message and logs it.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BusMessage,
    ) -> Result<()> {
        let outbound = Outbound {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        };

        match &self.sink {
            Sink::Unbounded(tx) => tx.send(outbound).map_err(|_| BusError::Closed),
            Sink::Block(tx) => tx.send(outbound).await.map_err(|_| BusError::Closed),
            Sink::DropNewest(tx) => match tx.try_send(outbound) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(outbound)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        exchange = %outbound.exchange,
                        routing_key = %outbound.routing_key,
                        "Bus publisher full, dropping message"
                    );
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(BusError::Closed),
            },
        }
    }

    /// Publish a typed payload.
    pub async fn publish_payload<P: Payload>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &P,
    ) -> Result<()> {
        let message = BusMessage::from_payload(payload)?;
        self.publish(exchange, routing_key, message).await
    }

    /// Messages dropped by the `drop-newest` policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn forward(broker: &dyn Broker, outbound: Outbound) {
    let Outbound {
        exchange,
        routing_key,
        message,
    } = outbound;

    match broker.publish(&exchange, &routing_key, message).await {
        Ok(()) => debug!(exchange = %exchange, routing_key = %routing_key, "Published"),
        Err(e) => warn!(
            exchange = %exchange,
            routing_key = %routing_key,
            "Bus publish failed: {}",
            e
        ),
    }
}
