//! Server errors, and the JSON-RPC error objects sent for calls that never
//! reach the bridge.

use crate::domain::config::ConfigError;
use shared_types::BusError;

/// JSON-RPC 2.0 codes the endpoint answers with.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// A malformed call. Bus failures are not `ApiError`s: they travel in-band
/// in the bridge's response.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl ApiError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Request body is not JSON.
    pub fn unreadable_body(error: &serde_json::Error) -> Self {
        Self::new(codes::PARSE_ERROR, format!("body is not JSON: {error}"))
    }

    pub fn empty_batch() -> Self {
        Self::new(codes::INVALID_REQUEST, "empty batch")
    }

    /// `id` absent, null or neither string nor number.
    pub fn bad_call_id() -> Self {
        Self::new(codes::INVALID_REQUEST, "id must be string or number")
    }

    pub fn method_missing() -> Self {
        Self::new(codes::INVALID_REQUEST, "method missing")
    }

    /// Anything outside the `bus_*` methods.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("unknown method {method}"))
    }

    /// `params` carries no usable bus request object.
    pub fn bad_request_object(details: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("bad bus request: {details}"))
    }

    /// The bridge's response could not be encoded.
    pub fn unencodable(error: &serde_json::Error) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("response not encodable: {error}"))
    }

    /// `{"code", "message"}` as placed under `error`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code, "message": self.message })
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Server-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener bind or serve failure
    #[error("server bind error: {0}")]
    Bind(String),

    /// Routing failure inside the bus
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Could not reach a peer server
    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },
}
