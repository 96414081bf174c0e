//! NATS-backed broker.
//!
//! Exchanges map onto subjects: a direct exchange publishes to
//! `<exchange>.<routing key>`, a fanout exchange to `<exchange>`, and the
//! default exchange to the queue name itself.
//!
//! Durable exchanges are JetStream streams with work-queue retention. A queue
//! bound to one gets a pull consumer filtered on the binding subject, and its
//! deliveries are settled with JetStream acks: `ack`, `term` for a reject, and
//! `nak` for a requeue. Everything else rides core NATS subscriptions, which
//! die with the client connection and settle as no-ops.

use crate::broker::{
    Acknowledger, Broker, BusMessage, Declarations, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, NoAck, QueueSpec, CORRELATION_HEADER, DEFAULT_EXCHANGE, ERROR_HEADER,
    TYPE_HEADER,
};
use crate::error::BusError;
use crate::Result;
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the reply queue. JetStream uses the message reply subject for acks.
const REPLY_TO_HEADER: &str = "reply-to";

/// How long the server keeps a consumer for an auto-delete queue with no client attached.
const AUTO_DELETE_THRESHOLD: Duration = Duration::from_secs(300);

/// Broker backed by a NATS server.
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
    declarations: Mutex<Declarations>,
    consumed: Mutex<HashSet<String>>,
}

/// Where a queue's messages come from.
#[derive(Debug, Default, PartialEq, Eq)]
struct QueueSources {
    /// Core NATS subjects.
    core: Vec<String>,
    /// (stream, filter subject) pairs for bindings to durable exchanges.
    streams: Vec<(String, String)>,
}

/// JetStream stream name for a durable exchange.
fn stream_name(exchange: &str) -> String {
    exchange
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Consumer name for a queue. Dots and other separators are not allowed.
fn consumer_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn exchange_subject(spec: &ExchangeSpec, routing_key: &str) -> String {
    match spec.kind {
        ExchangeKind::Direct => format!("{}.{}", spec.name, routing_key),
        ExchangeKind::Fanout => spec.name.clone(),
    }
}

/// Subject for a publish, and whether it goes through JetStream.
fn publish_target(declarations: &Declarations, exchange: &str, routing_key: &str) -> Result<(String, bool)> {
    if exchange == DEFAULT_EXCHANGE {
        return Ok((routing_key.to_string(), false));
    }

    let spec = declarations
        .exchanges
        .get(exchange)
        .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
    Ok((exchange_subject(spec, routing_key), spec.durable))
}

fn queue_sources(declarations: &Declarations, queue: &str) -> Result<QueueSources> {
    if !declarations.queues.contains_key(queue) {
        return Err(BusError::QueueNotFound(queue.to_string()));
    }

    let mut sources = QueueSources {
        core: vec![queue.to_string()],
        streams: Vec::new(),
    };
    for (exchange, key) in declarations.bindings.get(queue).into_iter().flatten() {
        let Some(spec) = declarations.exchanges.get(exchange) else {
            continue;
        };
        let subject = exchange_subject(spec, key);
        if spec.durable {
            let source = (stream_name(exchange), subject);
            if !sources.streams.contains(&source) {
                sources.streams.push(source);
            }
        } else if !sources.core.contains(&subject) {
            sources.core.push(subject);
        }
    }
    Ok(sources)
}

fn to_headers(message: &BusMessage) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(payload_type) = &message.payload_type {
        headers.insert(TYPE_HEADER, payload_type.as_str());
    }
    if let Some(correlation_id) = &message.correlation_id {
        headers.insert(CORRELATION_HEADER, correlation_id.as_str());
    }
    if let Some(reply_to) = &message.reply_to {
        headers.insert(REPLY_TO_HEADER, reply_to.as_str());
    }
    if let Some(error) = &message.error {
        headers.insert(ERROR_HEADER, error.as_str());
    }
    headers
}

/// Rebuild a bus message. `reply_subject` is only trusted for core NATS deliveries.
fn to_bus_message(headers: Option<&HeaderMap>, reply_subject: Option<String>, body: Bytes) -> BusMessage {
    let header = |name: &str| {
        headers
            .and_then(|h| h.get(name))
            .map(|v| v.as_str().to_string())
    };

    BusMessage {
        payload_type: header(TYPE_HEADER),
        correlation_id: header(CORRELATION_HEADER),
        error: header(ERROR_HEADER),
        reply_to: header(REPLY_TO_HEADER).or(reply_subject),
        body,
    }
}

fn core_delivery(message: async_nats::Message) -> Delivery {
    let reply = message.reply.as_ref().map(|s| s.to_string());
    let bus = to_bus_message(message.headers.as_ref(), reply, message.payload.clone());
    Delivery::new(bus, Box::new(NoAck))
}

fn jetstream_delivery(message: jetstream::Message) -> Delivery {
    let bus = to_bus_message(
        message.message.headers.as_ref(),
        None,
        message.message.payload.clone(),
    );
    Delivery::new(bus, Box::new(JetStreamAck { message }))
}

/// Settles a JetStream delivery.
struct JetStreamAck {
    message: jetstream::Message,
}

impl JetStreamAck {
    fn settle(self: Box<Self>, kind: AckKind) {
        tokio::spawn(async move {
            if let Err(e) = self.message.ack_with(kind).await {
                warn!("Failed to settle JetStream delivery: {}", e);
            }
        });
    }
}

impl Acknowledger for JetStreamAck {
    fn ack(self: Box<Self>) {
        self.settle(AckKind::Ack);
    }

    fn reject(self: Box<Self>, requeue: bool) {
        self.settle(if requeue { AckKind::Nak(None) } else { AckKind::Term });
    }
}

impl NatsBroker {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            declarations: Mutex::new(Declarations::default()),
            consumed: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_stream(&self, spec: &ExchangeSpec) -> Result<()> {
        let name = stream_name(&spec.name);
        let subject = match spec.kind {
            ExchangeKind::Direct => format!("{}.>", spec.name),
            ExchangeKind::Fanout => spec.name.clone(),
        };

        self.jetstream
            .get_or_create_stream(stream::Config {
                name: name.clone(),
                subjects: vec![subject],
                retention: stream::RetentionPolicy::WorkQueue,
                storage: stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Topology(format!("stream '{}': {}", name, e)))?;

        debug!(exchange = %spec.name, stream = %name, "JetStream stream ready");
        Ok(())
    }

    async fn stream_deliveries(
        &self,
        queue: &QueueSpec,
        stream_name: &str,
        filter_subject: String,
    ) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let name = consumer_name(&queue.name);
        let mut config = consumer::pull::Config {
            durable_name: Some(name.clone()),
            filter_subject,
            ack_policy: consumer::AckPolicy::Explicit,
            ..Default::default()
        };
        if queue.auto_delete {
            config.inactive_threshold = AUTO_DELETE_THRESHOLD;
        }

        let consumer = stream
            .get_or_create_consumer(&name, config)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(messages
            .filter_map(|item| async move {
                match item {
                    Ok(message) => Some(jetstream_delivery(message)),
                    Err(e) => {
                        warn!("JetStream delivery failed: {}", e);
                        None
                    }
                }
            })
            .boxed())
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        if self.declarations.lock().exchange(spec)? {
            debug!(exchange = %spec.name, kind = ?spec.kind, "Declared exchange");
            if spec.durable {
                self.ensure_stream(spec).await?;
            }
        }
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        if self.declarations.lock().queue(spec)? {
            debug!(queue = %spec.name, "Declared queue");
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.declarations.lock().bind(queue, exchange, routing_key)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: BusMessage) -> Result<()> {
        let (subject, durable) = publish_target(&self.declarations.lock(), exchange, routing_key)?;
        let headers = to_headers(&message);

        if durable {
            let ack = self
                .jetstream
                .publish_with_headers(subject, headers, message.body)
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
            ack.await.map_err(|e| BusError::Publish(e.to_string()))?;
            return Ok(());
        }

        self.client
            .publish_with_headers(subject, headers, message.body)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let (spec, sources) = {
            let declarations = self.declarations.lock();
            let sources = queue_sources(&declarations, queue)?;
            let spec = declarations
                .queues
                .get(queue)
                .cloned()
                .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
            (spec, sources)
        };
        if !self.consumed.lock().insert(queue.to_string()) {
            return Err(BusError::ConsumerExists(queue.to_string()));
        }

        let mut streams: Vec<DeliveryStream> = Vec::new();
        for subject in sources.core {
            debug!(queue, subject = %subject, "Subscribing");
            let subscriber = self
                .client
                .subscribe(subject)
                .await
                .map_err(|e| BusError::Connection(e.to_string()))?;
            streams.push(subscriber.map(core_delivery).boxed());
        }
        for (stream_name, filter_subject) in sources.streams {
            debug!(queue, stream = %stream_name, subject = %filter_subject, "Attaching JetStream consumer");
            streams.push(self.stream_deliveries(&spec, &stream_name, filter_subject).await?);
        }

        Ok(futures::stream::select_all(streams).boxed())
    }
}
