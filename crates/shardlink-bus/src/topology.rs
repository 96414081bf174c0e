//! Bus topology for one worker instance.

use crate::broker::{Broker, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::Result;
use tracing::info;

/// Direct exchange carrying requests addressed to one worker instance.
pub const REQUESTS_EXCHANGE: &str = "requests";

/// Fanout exchange carrying coordinator broadcasts to every worker.
pub const BROADCAST_EXCHANGE: &str = "broadcast-from-coordinator";

/// Fanout exchange carrying admission queue sync requests.
pub const QUEUE_SYNC_EXCHANGE: &str = "session-queue-sync";

/// Exchanges and queues owned by the instance identified by `routing_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    routing_key: String,
    worker_queue: String,
    reply_queue: String,
}

impl Topology {
    pub fn new(routing_key: impl Into<String>) -> Self {
        let routing_key = routing_key.into();
        Self {
            worker_queue: format!("worker.{}", routing_key),
            reply_queue: format!("reply.{}", routing_key),
            routing_key,
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Queue receiving requests and broadcasts for this instance.
    pub fn worker_queue(&self) -> &str {
        &self.worker_queue
    }

    /// Queue receiving replies to requests this instance issues.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// The shared exchanges every instance declares.
    pub fn exchanges() -> [ExchangeSpec; 3] {
        [
            ExchangeSpec::new(REQUESTS_EXCHANGE, ExchangeKind::Direct, true),
            ExchangeSpec::new(BROADCAST_EXCHANGE, ExchangeKind::Fanout, false),
            ExchangeSpec::new(QUEUE_SYNC_EXCHANGE, ExchangeKind::Fanout, false),
        ]
    }

    /// Declare exchanges, queues, and bindings. Safe to call more than once.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<()> {
        for exchange in Self::exchanges() {
            broker.declare_exchange(&exchange).await?;
        }

        broker
            .declare_queue(&QueueSpec::exclusive(&self.worker_queue))
            .await?;
        broker
            .declare_queue(&QueueSpec::exclusive(&self.reply_queue))
            .await?;

        broker
            .bind_queue(&self.worker_queue, REQUESTS_EXCHANGE, &self.routing_key)
            .await?;
        broker
            .bind_queue(&self.worker_queue, BROADCAST_EXCHANGE, "")
            .await?;
        broker
            .bind_queue(&self.worker_queue, QUEUE_SYNC_EXCHANGE, "")
            .await?;

        info!(
            routing_key = %self.routing_key,
            queue = %self.worker_queue,
            "Bus topology declared"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BusMessage;
    use crate::error::BusError;
    use crate::memory::MemoryBroker;
    use futures::StreamExt;

    #[test]
    fn test_queue_names() {
        let topology = Topology::new("w-1a2b");
        assert_eq!(topology.worker_queue(), "worker.w-1a2b");
        assert_eq!(topology.reply_queue(), "reply.w-1a2b");
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let broker = MemoryBroker::new();
        let topology = Topology::new("w-1");
        topology.declare(&broker).await.unwrap();
        topology.declare(&broker).await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_redeclaration_fails() {
        let broker = MemoryBroker::new();
        broker
            .declare_exchange(&ExchangeSpec::new(
                REQUESTS_EXCHANGE,
                ExchangeKind::Fanout,
                false,
            ))
            .await
            .unwrap();

        let err = Topology::new("w-1").declare(&broker).await.unwrap_err();
        assert!(matches!(err, BusError::Topology(_)));
    }

    #[tokio::test]
    async fn test_requests_reach_only_their_instance() {
        let broker = MemoryBroker::new();
        let a = Topology::new("a");
        let b = Topology::new("b");
        a.declare(&broker).await.unwrap();
        b.declare(&broker).await.unwrap();

        let mut a_rx = broker.consume(a.worker_queue()).await.unwrap();
        let mut b_rx = broker.consume(b.worker_queue()).await.unwrap();

        broker
            .publish(REQUESTS_EXCHANGE, "b", BusMessage::default().with_correlation_id("direct"))
            .await
            .unwrap();
        broker
            .publish(BROADCAST_EXCHANGE, "", BusMessage::default().with_correlation_id("fan"))
            .await
            .unwrap();

        let first_b = b_rx.next().await.unwrap();
        assert_eq!(first_b.message().correlation_id.as_deref(), Some("direct"));
        let second_b = b_rx.next().await.unwrap();
        assert_eq!(second_b.message().correlation_id.as_deref(), Some("fan"));

        let only_a = a_rx.next().await.unwrap();
        assert_eq!(only_a.message().correlation_id.as_deref(), Some("fan"));
    }
}
