//! The socket wire envelope.

use super::payload::Payload;
use crate::error::PayloadError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `responseId` value meaning "no response wanted".
pub const NO_RESPONSE: i64 = -1;

fn no_response() -> i64 {
    NO_RESPONSE
}

/// What an envelope is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    /// Handshake acknowledgement sent by the worker on (re)connect.
    Initial,

    /// Coordinator → worker call, answered when `responseId` is set.
    Request,

    /// Worker → coordinator answer to a request.
    Response,

    /// Unsolicited notification, never answered.
    Event,

    /// Coordinator declares its resume key and timeout.
    ConfigureResuming,
}

/// The framed unit exchanged over a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Operation kind.
    pub operation: Operation,

    /// Routing key of the worker instance that owns the session.
    #[serde(default)]
    pub routing_key: String,

    /// Payload discriminator.
    #[serde(rename = "type")]
    pub payload_type: String,

    /// Opaque payload body.
    #[serde(default)]
    pub payload: Value,

    /// Correlates a request with its response.
    #[serde(default = "no_response")]
    pub response_id: i64,

    /// Outcome flag, set on responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
}

impl Envelope {
    /// Build an envelope from raw parts.
    pub fn new(
        operation: Operation,
        routing_key: impl Into<String>,
        payload_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            operation,
            routing_key: routing_key.into(),
            payload_type: payload_type.into(),
            payload,
            response_id: NO_RESPONSE,
            successful: None,
        }
    }

    /// Build an event envelope from a typed payload.
    pub fn event<P: Payload>(
        routing_key: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            Operation::Event,
            routing_key,
            P::TYPE,
            serde_json::to_value(payload)?,
        ))
    }

    /// Build a request envelope from a typed payload.
    pub fn request<P: Payload>(
        routing_key: impl Into<String>,
        payload: &P,
        response_id: i64,
    ) -> Result<Self, serde_json::Error> {
        let mut envelope = Self::new(
            Operation::Request,
            routing_key,
            P::TYPE,
            serde_json::to_value(payload)?,
        );
        envelope.response_id = response_id;
        Ok(envelope)
    }

    /// Build a response envelope.
    pub fn response(
        routing_key: impl Into<String>,
        payload_type: impl Into<String>,
        payload: Value,
        response_id: i64,
        successful: bool,
    ) -> Self {
        let mut envelope = Self::new(Operation::Response, routing_key, payload_type, payload);
        envelope.response_id = response_id;
        envelope.successful = Some(successful);
        envelope
    }

    /// Whether this envelope is a request whose sender waits for a response.
    pub fn expects_response(&self) -> bool {
        self.operation == Operation::Request && self.response_id != NO_RESPONSE
    }

    /// Decode the payload as `P`, checking the type tag first.
    pub fn decode<P: Payload>(&self) -> Result<P, PayloadError> {
        P::from_value(&self.payload_type, self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AddSessionEvent, RunSessionRequest, ShardId};

    #[test]
    fn test_operation_wire_names() {
        let names: Vec<String> = [
            Operation::Initial,
            Operation::Request,
            Operation::Response,
            Operation::Event,
            Operation::ConfigureResuming,
        ]
        .iter()
        .map(|op| serde_json::to_string(op).unwrap())
        .collect();
        assert_eq!(
            names,
            vec![
                "\"initial\"",
                "\"request\"",
                "\"response\"",
                "\"event\"",
                "\"configureResuming\""
            ]
        );
    }

    #[test]
    fn test_request_defaults_to_fire_and_forget() {
        let json = r#"{"operation":"request","type":"RunSessionRequest","payload":{"shardId":3}}"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.response_id, NO_RESPONSE);
        assert!(!envelope.expects_response());
        assert_eq!(envelope.routing_key, "");
    }

    #[test]
    fn test_request_with_response_id_expects_response() {
        let envelope = Envelope::request("w-1", &RunSessionRequest { shard_id: ShardId(3) }, 42)
            .unwrap();
        assert!(envelope.expects_response());

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "RunSessionRequest");
        assert_eq!(json["responseId"], 42);
        assert_eq!(json["routingKey"], "w-1");
        assert!(json.get("successful").is_none());
    }

    #[test]
    fn test_response_carries_outcome() {
        let envelope = Envelope::response("w-1", "ErrorResponse", serde_json::json!({}), 7, false);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["operation"], "response");
        assert_eq!(json["successful"], false);
        assert_eq!(json["responseId"], 7);
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let json = r#"{"operation":"shout","type":"X"}"#;
        assert!(serde_json::from_str::<Envelope>(json).is_err());
    }

    #[test]
    fn test_decode_checks_type_tag() {
        let envelope = Envelope::request("w-1", &RunSessionRequest { shard_id: ShardId(1) }, 1)
            .unwrap();
        assert!(envelope.decode::<RunSessionRequest>().is_ok());
        assert!(matches!(
            envelope.decode::<AddSessionEvent>(),
            Err(PayloadError::TypeMismatch { .. })
        ));
    }
}
