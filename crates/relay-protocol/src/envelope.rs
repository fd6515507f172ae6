//! The wire message unit.
//!
//! An envelope pairs a [`Topic`] with an opaque JSON payload. On the wire it
//! is the object `{"event": "<channel>:<event>", "data": <any>}`.

use crate::codec::ProtocolError;
use crate::topic::Topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved channel carrying `register`, `unregister` and `info`.
pub const CONTROL_CHANNEL: &str = "relay";

/// Reserved channel that clients dispatch in-process and never send.
pub const LOOPBACK_CHANNEL: &str = "local";

/// Functions understood on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFunction {
    /// Subscribe the sender to one or more topics.
    Register,
    /// Unsubscribe the sender from one or more topics.
    Unregister,
    /// Server greeting sent when a session opens.
    Info,
    /// Anything else; ignored by the router.
    Other(String),
}

impl ControlFunction {
    fn from_event(event: &str) -> Self {
        match event {
            "register" => ControlFunction::Register,
            "unregister" => ControlFunction::Unregister,
            "info" => ControlFunction::Info,
            other => ControlFunction::Other(other.to_string()),
        }
    }
}

/// A relayed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing key.
    #[serde(rename = "event")]
    pub topic: Topic,
    /// Opaque payload.
    #[serde(rename = "data")]
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(topic: Topic, payload: Value) -> Self {
        Self { topic, payload }
    }

    /// Build a `relay:register` request for a topic.
    #[must_use]
    pub fn register(topic: &Topic) -> Self {
        Self::control("register", Value::String(topic.to_string()))
    }

    /// Build a `relay:unregister` request for a topic.
    #[must_use]
    pub fn unregister(topic: &Topic) -> Self {
        Self::control("unregister", Value::String(topic.to_string()))
    }

    /// Build the `relay:info` greeting.
    #[must_use]
    pub fn info(payload: Value) -> Self {
        Self::control("info", payload)
    }

    fn control(function: &str, payload: Value) -> Self {
        Self {
            topic: Topic::from_parts_unchecked(CONTROL_CHANNEL, function),
            payload,
        }
    }

    /// Whether this envelope travels on the control channel.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.topic.is_on(CONTROL_CHANNEL)
    }

    /// Whether this envelope travels on the loopback channel.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        self.topic.is_on(LOOPBACK_CHANNEL)
    }

    /// The control function named by this envelope, if it is a control message.
    #[must_use]
    pub fn control_function(&self) -> Option<ControlFunction> {
        self.is_control()
            .then(|| ControlFunction::from_event(self.topic.event()))
    }

    /// Topics named by a `register` / `unregister` payload.
    ///
    /// The payload is either a single topic string or an array of them.
    /// Each entry is parsed independently so one bad entry does not hide
    /// the others.
    #[must_use]
    pub fn control_topics(&self) -> Vec<Result<Topic, ProtocolError>> {
        match &self.payload {
            Value::String(raw) => vec![Topic::parse(raw.as_str())],
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(raw) => Topic::parse(raw.as_str()),
                    _ => Err(ProtocolError::MalformedEnvelope("topic entry is not a string")),
                })
                .collect(),
            _ => vec![Err(ProtocolError::MalformedEnvelope(
                "control payload is not a topic or topic list",
            ))],
        }
    }
}
