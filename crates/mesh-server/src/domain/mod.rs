//! Configuration and error types of the server.

pub mod config;
pub mod error;

pub use config::{ConfigError, PeerConfig, RpcConfig, ServerConfig};
pub use error::{ApiError, ApiResult, ServerError};
