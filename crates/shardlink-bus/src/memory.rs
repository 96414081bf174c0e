//! In-process broker with AMQP routing and acknowledgement semantics.

use crate::broker::{
    Acknowledger, Broker, BusMessage, Declarations, Delivery, DeliveryStream, ExchangeSpec,
    QueueSpec,
};
use crate::error::BusError;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Settlement counters for one queue.
#[derive(Debug, Default)]
struct Counters {
    acked: AtomicUsize,
    rejected: AtomicUsize,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: Option<mpsc::UnboundedReceiver<BusMessage>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct State {
    declarations: Declarations,
    queues: HashMap<String, MemoryQueue>,
}

/// Broker living inside the process.
///
/// Used for single-process deployments (`memory://`) and by tests that play
/// the coordinator side of the bus.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries acknowledged on `queue` so far.
    pub fn acked(&self, queue: &str) -> usize {
        self.counter(queue, |c| c.acked.load(Ordering::SeqCst))
    }

    /// Deliveries rejected on `queue` so far.
    pub fn rejected(&self, queue: &str) -> usize {
        self.counter(queue, |c| c.rejected.load(Ordering::SeqCst))
    }

    fn counter(&self, queue: &str, read: impl Fn(&Counters) -> usize) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| read(&q.counters))
            .unwrap_or(0)
    }
}

struct MemoryAck {
    message: BusMessage,
    requeue_tx: mpsc::UnboundedSender<BusMessage>,
    counters: Arc<Counters>,
}

impl Acknowledger for MemoryAck {
    fn ack(self: Box<Self>) {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
    }

    fn reject(self: Box<Self>, requeue: bool) {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        if requeue {
            let _ = self.requeue_tx.send(self.message);
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        if self.state.lock().declarations.exchange(spec)? {
            debug!(exchange = %spec.name, kind = ?spec.kind, "Declared exchange");
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.declarations.queue(spec)? {
            let (tx, rx) = mpsc::unbounded_channel();
            state.queues.insert(
                spec.name.clone(),
                MemoryQueue {
                    tx,
                    rx: Some(rx),
                    counters: Arc::new(Counters::default()),
                },
            );
            debug!(queue = %spec.name, "Declared queue");
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.state
            .lock()
            .declarations
            .bind(queue, exchange, routing_key)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: BusMessage) -> Result<()> {
        let state = self.state.lock();
        let targets = state.declarations.route(exchange, routing_key)?;

        if targets.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = state.queues.get(&target) {
                if queue.tx.send(message.clone()).is_err() {
                    debug!(queue = %target, "Queue consumer gone, message dropped");
                }
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let (rx, requeue_tx, counters) = {
            let mut state = self.state.lock();
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
            let rx = entry
                .rx
                .take()
                .ok_or_else(|| BusError::ConsumerExists(queue.to_string()))?;
            (rx, entry.tx.clone(), entry.counters.clone())
        };

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let requeue_tx = requeue_tx.clone();
            let counters = counters.clone();
            async move {
                let message = rx.recv().await?;
                let acker = MemoryAck {
                    message: message.clone(),
                    requeue_tx,
                    counters,
                };
                Some((Delivery::new(message, Box::new(acker)), rx))
            }
        });

        Ok(Box::pin(stream))
    }
}
