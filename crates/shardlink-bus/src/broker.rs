//! Broker abstraction with AMQP-style exchanges, queues, and acknowledgements.

use crate::error::BusError;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use shardlink_core::types::Payload;
use std::collections::HashMap;
use std::fmt;

/// Name of the default exchange; routing key is the destination queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Header carrying the payload type tag.
pub const TYPE_HEADER: &str = "type";

/// Header carrying the request correlation id.
pub const CORRELATION_HEADER: &str = "correlation-id";

/// Header set on error replies.
pub const ERROR_HEADER: &str = "error";

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues bound with the exact routing key.
    Direct,

    /// Deliver to every bound queue.
    Fanout,
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            durable,
        }
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// An exclusive, auto-delete queue owned by this connection.
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A message on the bus.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusMessage {
    /// Payload type tag (`type` header).
    pub payload_type: Option<String>,

    /// Correlation id linking a reply to its request.
    pub correlation_id: Option<String>,

    /// Queue the responder should reply to.
    pub reply_to: Option<String>,

    /// Diagnostic carried by error replies (`error` header).
    pub error: Option<String>,

    /// JSON body.
    pub body: Bytes,
}

impl BusMessage {
    /// Build a message from a typed payload.
    pub fn from_payload<P: Payload>(payload: &P) -> Result<Self> {
        Ok(Self {
            payload_type: Some(P::TYPE.to_string()),
            body: Bytes::from(serde_json::to_vec(payload)?),
            ..Self::default()
        })
    }

    /// Build a message from a type tag and a JSON body.
    pub fn from_value(payload_type: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            payload_type: Some(payload_type.into()),
            body: Bytes::from(serde_json::to_vec(value)?),
            ..Self::default()
        })
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply queue.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Mark this message as an error reply.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Decode the body as `P`, checking the type header.
    pub fn decode<P: Payload>(&self) -> Result<P> {
        let type_name = self.payload_type.as_deref().ok_or(BusError::MissingType)?;
        let value: serde_json::Value = serde_json::from_slice(&self.body)?;
        Ok(P::from_value(type_name, value)?)
    }
}

/// Settles a delivery with the broker.
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement.
    fn ack(self: Box<Self>);

    /// Negative acknowledgement, optionally putting the message back on its queue.
    fn reject(self: Box<Self>, requeue: bool);
}

/// Acknowledger for brokers without delivery settlement.
pub struct NoAck;

impl Acknowledger for NoAck {
    fn ack(self: Box<Self>) {}

    fn reject(self: Box<Self>, _requeue: bool) {}
}

/// A message received from a queue, settled exactly once.
pub struct Delivery {
    message: BusMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: BusMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    /// The received message.
    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    /// Acknowledge the delivery.
    pub fn ack(self) {
        self.acker.ack();
    }

    /// Reject the delivery.
    pub fn reject(self, requeue: bool) {
        self.acker.reject(requeue);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one queue.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// A message broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Redeclaring with the same properties is a no-op.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue. Redeclaring with the same properties is a no-op.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Bind a queue to an exchange under a routing key.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message.
    async fn publish(&self, exchange: &str, routing_key: &str, message: BusMessage) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;
}

/// Declared topology shared by broker implementations.
#[derive(Debug, Default)]
pub(crate) struct Declarations {
    pub exchanges: HashMap<String, ExchangeSpec>,
    pub queues: HashMap<String, QueueSpec>,
    /// queue name -> (exchange, routing key)
    pub bindings: HashMap<String, Vec<(String, String)>>,
}

impl Declarations {
    /// Record an exchange. Returns `false` when it already existed.
    pub fn exchange(&mut self, spec: &ExchangeSpec) -> Result<bool> {
        match self.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(false),
            Some(existing) => Err(BusError::Topology(format!(
                "exchange '{}' already declared as {:?} (durable: {})",
                spec.name, existing.kind, existing.durable
            ))),
            None => {
                self.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(true)
            }
        }
    }

    /// Record a queue. Returns `false` when it already existed.
    pub fn queue(&mut self, spec: &QueueSpec) -> Result<bool> {
        match self.queues.get(&spec.name) {
            Some(existing) if existing == spec => Ok(false),
            Some(_) => Err(BusError::Topology(format!(
                "queue '{}' already declared with different properties",
                spec.name
            ))),
            None => {
                self.queues.insert(spec.name.clone(), spec.clone());
                Ok(true)
            }
        }
    }

    /// Record a binding.
    pub fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(BusError::ExchangeNotFound(exchange.to_string()));
        }

        let bindings = self.bindings.entry(queue.to_string()).or_default();
        let binding = (exchange.to_string(), routing_key.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    /// Queues a publish to `exchange` under `routing_key` is delivered to.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let spec = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;

        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, bindings)| {
                bindings.iter().any(|(ex, key)| {
                    ex == exchange && (spec.kind == ExchangeKind::Fanout || key == routing_key)
                })
            })
            .map(|(queue, _)| queue.clone())
            .collect();
        targets.sort();
        Ok(targets)
    }
}
