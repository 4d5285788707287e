//! Message envelope delivered over bus channels.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

/// Which way a message travels relative to the service answering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outbound request for a service.
    Request,
    /// Reply or broadcast from a service.
    Response,
    /// Failed reply from a service.
    Error,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Direction::Request => "request",
            Direction::Response => "response",
            Direction::Error => "error",
        };
        f.write_str(name)
    }
}

/// Immutable message envelope.
///
/// Messages are wrapped in `Arc` while they fan out to handlers, so every
/// handler observes the same value. The payload is JSON; handlers that know
/// the concrete shape decode it with [`Message::payload_as`].
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    channel: String,
    direction: Direction,
    payload: Value,
    correlation_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(
        channel: impl Into<String>,
        direction: Direction,
        payload: Value,
        correlation_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            direction,
            payload,
            correlation_id,
            created_at: Utc::now(),
        }
    }

    /// Create a request message.
    pub fn request(channel: impl Into<String>, payload: Value, correlation_id: Option<Uuid>) -> Self {
        Self::new(channel, Direction::Request, payload, correlation_id)
    }

    /// Create a response message.
    pub fn response(channel: impl Into<String>, payload: Value, correlation_id: Option<Uuid>) -> Self {
        Self::new(channel, Direction::Response, payload, correlation_id)
    }

    /// Create an error message.
    pub fn error(channel: impl Into<String>, payload: Value, correlation_id: Option<Uuid>) -> Self {
        Self::new(channel, Direction::Error, payload, correlation_id)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Correlation id (destination id) this message is addressed to, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_error(&self) -> bool {
        self.direction == Direction::Error
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }

    /// Payload rendered as a human-readable error string.
    ///
    /// String payloads are returned verbatim; anything else is rendered as JSON.
    pub fn error_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
