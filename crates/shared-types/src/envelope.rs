//! # Envelope
//!
//! The message unit of the bus. Routing metadata is carried in typed optional
//! fields; any other key lands in [`Envelope::payload`]. On the wire the
//! envelope is one flat JSON object:
//!
//! ```json
//! {"action":"pub","topic":"greet","data":{"msg":"hi"},"from":"client-1"}
//! ```
//!
//! Each hop mutates the envelope in place (the bus stamps `topic`/`to_id`,
//! federation stamps `from_publisher`), so handlers always receive an owned
//! value.

use crate::errors::BusError;
use crate::Action;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A flat JSON message with typed routing fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Control action (connection protocol only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Topic the envelope was published to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Application payload of a control action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Sender identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target identity of a `pub_id` action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Target identity stamped on point-to-point deliveries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    /// Correlation topic the receiver should acknowledge on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Server address (federation actions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    /// Address of the server that forwarded this envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_publisher: Option<String>,
    /// Whether `addr` should be dialed over TLS.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    /// Subscriber name for named delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Topic directory advertised by a peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    /// Identities advertised by a peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// In-band protocol error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Every other key.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Empty envelope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Control envelope carrying `action`.
    pub fn action(action: Action) -> Self {
        Self {
            action: Some(action.as_str().to_string()),
            ..Self::default()
        }
    }

    /// Build a publishable envelope from an application value.
    ///
    /// Objects become the envelope itself, strings are wrapped as
    /// `{"data": "..."}`. Any other shape is rejected.
    pub fn from_payload(value: Value) -> Result<Self, BusError> {
        match value {
            Value::Object(map) => serde_json::from_value(Value::Object(map))
                .map_err(|e| BusError::MalformedEnvelope(e.to_string())),
            Value::String(s) => Ok(Self::new().with_data(Value::String(s))),
            other => Err(BusError::MalformedEnvelope(format!(
                "type not handled, data must be an object or a string, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, BusError> {
        serde_json::from_str(text).map_err(|e| BusError::MalformedEnvelope(e.to_string()))
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::MalformedEnvelope(e.to_string()))
    }

    /// Convert to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The parsed control action, if any and known.
    pub fn parsed_action(&self) -> Option<Action> {
        self.action.as_deref().and_then(Action::parse)
    }

    /// `{"data":"pong"}`
    pub fn pong() -> Self {
        Self::new().with_data(Value::String("pong".into()))
    }

    /// Correlation acknowledgement `{"ok":"done","from":<from>}`.
    pub fn ack(from: impl Into<String>) -> Self {
        Self::new()
            .with_from(from)
            .with_field("ok", Value::String("done".into()))
    }

    /// In-band error reply.
    pub fn error_reply(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn with_ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Set an arbitrary payload key.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Look up a payload key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// `data` as a string slice, if it is one.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
