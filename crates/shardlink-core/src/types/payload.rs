//! Typed payloads carried by envelopes and bus messages.
//!
//! Every payload shape names its own type tag through [`Payload::TYPE`]. The
//! tag travels next to the body (the envelope `type` field, or the bus `type`
//! header) and is only inspected at the decode boundary.

use super::identifiers::{GuildId, SessionId, ShardId};
use crate::error::PayloadError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload shape with a stable type tag.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag written next to the serialized body.
    const TYPE: &'static str;

    /// Decode a body that arrived under `type_name`.
    fn from_value(type_name: &str, value: Value) -> Result<Self, PayloadError> {
        if type_name != Self::TYPE {
            return Err(PayloadError::TypeMismatch {
                expected: Self::TYPE,
                actual: type_name.to_string(),
            });
        }
        serde_json::from_value(value).map_err(|source| PayloadError::Malformed {
            type_name: type_name.to_string(),
            source,
        })
    }
}

/// Handshake acknowledgement, the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialHandshake {
    pub session_id: SessionId,
    pub routing_key: String,
    pub resumed: bool,
}

impl Payload for InitialHandshake {
    const TYPE: &'static str = "InitialHandshake";
}

/// Resume configuration declared by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureResuming {
    /// Resume key; `None` or empty disables resuming.
    #[serde(default)]
    pub key: Option<String>,

    /// Seconds to keep the session paused before expiring it.
    #[serde(default = "default_resume_timeout")]
    pub timeout: u64,
}

fn default_resume_timeout() -> u64 {
    60
}

impl Payload for ConfigureResuming {
    const TYPE: &'static str = "ConfigureResuming";
}

/// A shard entered the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSessionEvent {
    pub shard_id: ShardId,
    pub total_shards: u32,
    pub routing_key: String,
}

impl Payload for AddSessionEvent {
    const TYPE: &'static str = "AddSessionEvent";
}

/// A shard left the admission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSessionEvent {
    pub shard_id: ShardId,
    pub routing_key: String,
}

impl Payload for RemoveSessionEvent {
    const TYPE: &'static str = "RemoveSessionEvent";
}

/// Coordinator asks the worker to connect a queued shard now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSessionRequest {
    pub shard_id: ShardId,
}

impl Payload for RunSessionRequest {
    const TYPE: &'static str = "RunSessionRequest";
}

/// Result of a [`RunSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSessionResponse {
    pub shard_id: ShardId,
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Payload for RunSessionResponse {
    const TYPE: &'static str = "RunSessionResponse";
}

/// Coordinator asks for every queued shard to be announced again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueRequest {}

impl Payload for SyncQueueRequest {
    const TYPE: &'static str = "SyncQueueRequest";
}

/// Shards announced by a [`SyncQueueRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueResponse {
    pub queued: Vec<ShardId>,
}

impl Payload for SyncQueueResponse {
    const TYPE: &'static str = "SyncQueueResponse";
}

/// Subscribe the requesting session to a guild's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeGuildRequest {
    pub guild_id: GuildId,
}

impl Payload for SubscribeGuildRequest {
    const TYPE: &'static str = "SubscribeGuildRequest";
}

/// Result of a [`SubscribeGuildRequest`]; `deferred` means the owning shard was not ready yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeGuildResponse {
    pub guild_id: GuildId,
    pub deferred: bool,
}

impl Payload for SubscribeGuildResponse {
    const TYPE: &'static str = "SubscribeGuildResponse";
}

/// Diagnostic body of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

impl Payload for ErrorResponse {
    const TYPE: &'static str = "ErrorResponse";
}

/// Admission queue membership notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Added(AddSessionEvent),
    Removed(RemoveSessionEvent),
}

impl QueueEvent {
    /// Type tag of the wrapped payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Added(_) => AddSessionEvent::TYPE,
            Self::Removed(_) => RemoveSessionEvent::TYPE,
        }
    }

    /// Shard the notification is about.
    pub fn shard_id(&self) -> ShardId {
        match self {
            Self::Added(event) => event.shard_id,
            Self::Removed(event) => event.shard_id,
        }
    }

    /// Serialize the wrapped payload body.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Added(event) => serde_json::to_value(event),
            Self::Removed(event) => serde_json::to_value(event),
        }
    }

    /// Decode a notification from its type tag and body.
    pub fn decode(type_name: &str, value: Value) -> Result<Self, PayloadError> {
        match type_name {
            AddSessionEvent::TYPE => AddSessionEvent::from_value(type_name, value).map(Self::Added),
            RemoveSessionEvent::TYPE => {
                RemoveSessionEvent::from_value(type_name, value).map(Self::Removed)
            }
            other => Err(PayloadError::UnknownType(other.to_string())),
        }
    }
}
