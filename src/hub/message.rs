//! Inter-agent message type.
//!
//! Messages are immutable once enqueued: all fields are private and only
//! constructors produce them. Payloads are opaque `serde_json::Value` - the
//! bus never inspects them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a message is, for routing and correlation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Expects a correlated response.
    Request,
    /// Answers a previous request; must carry that request's id.
    Response,
    /// One-way notification.
    Event,
}

/// Where a message is going: a named agent or a broadcast topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Agent(String),
    Topic(String),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Agent(name) => write!(f, "agent:{}", name),
            Address::Topic(topic) => write!(f, "topic:{}", topic),
        }
    }
}

/// A message between agents.
///
/// # Invariants
/// - Immutable once constructed
/// - A `Response` always carries the `correlation_id` of its request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: String,
    address: Address,
    kind: MessageKind,
    correlation_id: Option<MessageId>,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl Message {
    /// A point-to-point request expecting a response.
    pub fn request(sender: impl Into<String>, recipient: impl Into<String>, payload: Value) -> Self {
        Self::build(
            sender,
            Address::Agent(recipient.into()),
            MessageKind::Request,
            None,
            payload,
        )
    }

    /// A response to a previously received request.
    pub fn response(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        in_reply_to: MessageId,
        payload: Value,
    ) -> Self {
        Self::build(
            sender,
            Address::Agent(recipient.into()),
            MessageKind::Response,
            Some(in_reply_to),
            payload,
        )
    }

    /// A one-way event to a named agent.
    pub fn event(sender: impl Into<String>, recipient: impl Into<String>, payload: Value) -> Self {
        Self::build(
            sender,
            Address::Agent(recipient.into()),
            MessageKind::Event,
            None,
            payload,
        )
    }

    /// A broadcast event for a topic; delivered via `publish`.
    pub fn broadcast(sender: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self::build(
            sender,
            Address::Topic(topic.into()),
            MessageKind::Event,
            None,
            payload,
        )
    }

    fn build(
        sender: impl Into<String>,
        address: Address,
        kind: MessageKind,
        correlation_id: Option<MessageId>,
        payload: Value,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender: sender.into(),
            address,
            kind,
            correlation_id,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Concrete recipient, if this is a point-to-point message.
    pub fn recipient(&self) -> Option<&str> {
        match &self.address {
            Address::Agent(name) => Some(name),
            Address::Topic(_) => None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn correlation_id(&self) -> Option<MessageId> {
        self.correlation_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_carries_correlation() {
        let request = Message::request("front_desk", "billing", json!({"order": 17}));
        let response = Message::response("billing", "front_desk", request.id(), json!({"ok": true}));
        assert_eq!(response.correlation_id(), Some(request.id()));
        assert_eq!(response.kind(), MessageKind::Response);
    }

    #[test]
    fn test_broadcast_has_no_concrete_recipient() {
        let msg = Message::broadcast("front_desk", "outage", json!({}));
        assert!(msg.recipient().is_none());
        assert_eq!(msg.address(), &Address::Topic("outage".into()));
    }
}
