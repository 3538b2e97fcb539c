//! Request/response shapes of the polling RPC transport.
//!
//! Every bus method takes one [`RpcRequest`] and answers one [`RpcResponse`].
//! They travel as the params/result of JSON-RPC 2.0 calls.

use crate::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_PING: &str = "bus_ping";
pub const METHOD_SUBSCRIBE: &str = "bus_subscribe";
pub const METHOD_UNSUBSCRIBE: &str = "bus_unsubscribe";
pub const METHOD_PUBLISH: &str = "bus_publish";
pub const METHOD_PUBLISH_TO_ID: &str = "bus_publishToId";
pub const METHOD_REMOVE_TOPIC: &str = "bus_removeTopic";
pub const METHOD_POLL: &str = "bus_poll";

/// Arguments of a bus RPC method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcRequest {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target identity of `publish_to_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl RpcRequest {
    pub fn new(action: &str, from: &str) -> Self {
        Self {
            action: action.to_string(),
            from: Some(from.to_string()),
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

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Result of a bus RPC method. `data` is empty when there is nothing to return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_data(data: Envelope) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}
