//! Typed request/response over the bus.
//!
//! Inbound deliveries on the worker queue are decoded by their `type` header,
//! dispatched to a handler registered for that payload, answered through the
//! default exchange when the sender asked for a reply, and then settled:
//! ack on success, reject without requeue on any failure. Outbound requests
//! are correlated with their replies through a table of waiting senders.

use crate::broker::{Broker, BusMessage, Delivery, DeliveryStream, DEFAULT_EXCHANGE};
use crate::error::BusError;
use crate::publisher::BusPublisher;
use crate::topology::{Topology, REQUESTS_EXCHANGE};
use crate::Result;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use shardlink_core::error::PayloadError;
use shardlink_core::types::{ErrorResponse, Payload};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Default number of deliveries handled at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Default time a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A handler's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub payload_type: String,
    pub body: Value,
}

impl Reply {
    /// Build a reply from a typed payload.
    pub fn new<P: Payload>(payload: &P) -> Result<Self> {
        Ok(Self {
            payload_type: P::TYPE.to_string(),
            body: serde_json::to_value(payload)?,
        })
    }
}

/// Future returned by a bus handler.
pub type HandlerFuture = BoxFuture<'static, Result<Option<Reply>>>;

type BoxedHandler = Arc<dyn Fn(&str, Value) -> HandlerFuture + Send + Sync>;

/// Handlers keyed by payload type tag.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for payload `P`. A later registration for the same tag replaces it.
    pub fn register<P, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        P: Payload,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Reply>>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let boxed: BoxedHandler = Arc::new(move |type_name: &str, value: Value| {
            match P::from_value(type_name, value) {
                Ok(payload) => handler(payload).boxed(),
                Err(e) => async move { Err(BusError::Payload(e)) }.boxed(),
            }
        });
        self.handlers.insert(P::TYPE, boxed);
        self
    }

    /// Whether a handler exists for `type_name`.
    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Registered type tags, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn get(&self, type_name: &str) -> Option<BoxedHandler> {
        self.handlers.get(type_name).cloned()
    }
}

/// Tuning for [`BusRpc`].
#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    pub max_concurrency: usize,
    pub request_timeout: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Bus RPC endpoint for one worker instance.
pub struct BusRpc {
    broker: Arc<dyn Broker>,
    publisher: BusPublisher,
    topology: Topology,
    handlers: HandlerRegistry,
    pending: DashMap<String, oneshot::Sender<BusMessage>>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl BusRpc {
    pub fn new(
        broker: Arc<dyn Broker>,
        publisher: BusPublisher,
        topology: Topology,
        handlers: HandlerRegistry,
        options: RpcOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            publisher,
            topology,
            handlers,
            pending: DashMap::new(),
            permits: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
            request_timeout: options.request_timeout,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn publisher(&self) -> &BusPublisher {
        &self.publisher
    }

    /// Declare the topology and start consuming the worker and reply queues.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.topology.declare(self.broker.as_ref()).await?;

        let requests = self.broker.consume(self.topology.worker_queue()).await?;
        let replies = self.broker.consume(self.topology.reply_queue()).await?;

        info!(
            routing_key = %self.topology.routing_key(),
            handlers = ?self.handlers.types(),
            "Bus RPC started"
        );

        Ok(vec![
            tokio::spawn(self.clone().serve(requests)),
            tokio::spawn(self.clone().collect_replies(replies)),
        ])
    }

    async fn serve(self: Arc<Self>, mut deliveries: DeliveryStream) {
        while let Some(delivery) = deliveries.next().await {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let rpc = self.clone();
            tokio::spawn(async move {
                rpc.handle_delivery(delivery).await;
                drop(permit);
            });
        }
        debug!("Bus request stream ended");
    }

    /// Dispatch one delivery, reply if asked to, and settle it.
    #[instrument(skip_all, fields(payload_type = ?delivery.message().payload_type))]
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let reply_to = delivery.message().reply_to.clone();
        let correlation_id = delivery.message().correlation_id.clone();

        let outcome = match self.dispatch(delivery.message()).await {
            Ok(None) if reply_to.is_some() => Err(BusError::Protocol(
                "handler produced no reply for a request expecting one".to_string(),
            )),
            other => other,
        };

        match outcome {
            Ok(Some(reply)) => {
                if let Some(reply_to) = reply_to.as_deref() {
                    let sent = BusMessage::from_value(reply.payload_type, &reply.body)
                        .map(|m| with_correlation(m, correlation_id.as_deref()));
                    let sent = match sent {
                        Ok(message) => {
                            self.publisher
                                .publish(DEFAULT_EXCHANGE, reply_to, message)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("Failed to publish reply to {}: {}", reply_to, e);
                        delivery.reject(false);
                        return;
                    }
                }
                delivery.ack();
            }
            Ok(None) => delivery.ack(),
            Err(e) => {
                warn!("Rejecting bus message: {}", e);
                if let Some(reply_to) = reply_to.as_deref() {
                    self.send_error_reply(reply_to, correlation_id.as_deref(), &e)
                        .await;
                }
                delivery.reject(false);
            }
        }
    }

    async fn dispatch(&self, message: &BusMessage) -> Result<Option<Reply>> {
        let type_name = message.payload_type.as_deref().ok_or(BusError::MissingType)?;
        let handler = self
            .handlers
            .get(type_name)
            .ok_or_else(|| PayloadError::UnknownType(type_name.to_string()))?;
        let value: Value = serde_json::from_slice(&message.body)?;

        debug!(payload_type = type_name, "Dispatching bus message");
        handler(type_name, value).await
    }

    async fn send_error_reply(&self, reply_to: &str, correlation_id: Option<&str>, error: &BusError) {
        let diagnostic = error.to_string();
        let message = match BusMessage::from_payload(&ErrorResponse::new(diagnostic.clone())) {
            Ok(message) => with_correlation(message.with_error(diagnostic), correlation_id),
            Err(e) => {
                warn!("Failed to encode error reply: {}", e);
                return;
            }
        };

        if let Err(e) = self
            .publisher
            .publish(DEFAULT_EXCHANGE, reply_to, message)
            .await
        {
            warn!("Failed to publish error reply to {}: {}", reply_to, e);
        }
    }

    async fn collect_replies(self: Arc<Self>, mut deliveries: DeliveryStream) {
        while let Some(delivery) = deliveries.next().await {
            let waiter = delivery
                .message()
                .correlation_id
                .as_deref()
                .and_then(|id| self.pending.remove(id))
                .map(|(_, tx)| tx);

            match waiter {
                Some(tx) => {
                    let message = delivery.message().clone();
                    delivery.ack();
                    let _ = tx.send(message);
                }
                None => {
                    debug!(
                        correlation_id = ?delivery.message().correlation_id,
                        "Discarding reply with no waiting request"
                    );
                    delivery.ack();
                }
            }
        }
        debug!("Bus reply stream ended");
    }

    /// Send a request to the instance at `routing_key` and wait for its reply.
    pub async fn request<Req, Resp>(&self, routing_key: &str, payload: &Req) -> Result<Resp>
    where
        Req: Payload,
        Resp: Payload,
    {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let message = BusMessage::from_payload(payload)?
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.topology.reply_queue());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);

        if let Err(e) = self
            .publisher
            .publish(REQUESTS_EXCHANGE, routing_key, message)
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(BusError::Closed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                return Err(BusError::Timeout(self.request_timeout));
            }
        };

        if let Some(error) = reply.error {
            return Err(BusError::Remote(error));
        }
        reply.decode()
    }

    /// Publish a payload on a shared exchange without waiting for anything.
    pub async fn broadcast<P: Payload>(&self, exchange: &str, payload: &P) -> Result<()> {
        self.publisher.publish_payload(exchange, "", payload).await
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

fn with_correlation(message: BusMessage, correlation_id: Option<&str>) -> BusMessage {
    match correlation_id {
        Some(id) => message.with_correlation_id(id),
        None => message,
    }
}
