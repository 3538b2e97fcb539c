//! Client error types.

use shared_types::BusError;
use thiserror::Error;

/// Errors that can occur when talking to a bus server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("server rejected request: {0}")]
    Server(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Whether the failure means the transport is gone (triggers restart).
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Handshake(_) | Self::WebSocket(_) | Self::Closed => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Bus(BusError::TransportClosed) => true,
            _ => false,
        }
    }
}
