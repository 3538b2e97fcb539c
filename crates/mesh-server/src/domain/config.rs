//! Server configuration with validation.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 9313;

/// Default maximum inbound frame size (1MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity of this server on the bus. Random when empty.
    pub id: String,
    /// Bind address
    pub host: IpAddr,
    /// Bind port
    pub port: u16,
    /// `host:port` peers use to reach this server. Defaults to the bind address.
    pub advertise_addr: Option<String>,
    /// WebSocket endpoint path
    pub ws_path: String,
    /// How long wait variants wait for an acknowledgement
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
    /// Maximum inbound frame size in bytes
    pub max_message_size: usize,
    /// RPC bridge configuration
    pub rpc: RpcConfig,
    /// Servers to join at startup
    pub peers: Vec<PeerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            host: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: DEFAULT_PORT,
            advertise_addr: None,
            ws_path: shared_types::DEFAULT_WS_PATH.to_string(),
            reply_timeout: shared_bus::DEFAULT_REPLY_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rpc: RpcConfig::default(),
            peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.ws_path.clone()));
        }
        if self.rpc.enabled {
            if !self.rpc.path.starts_with('/') {
                return Err(ConfigError::InvalidPath(self.rpc.path.clone()));
            }
            if self.rpc.path == self.ws_path {
                return Err(ConfigError::Invalid(
                    "rpc.path and ws_path must differ".into(),
                ));
            }
            if self.rpc.queue_capacity == 0 {
                return Err(ConfigError::InvalidLimit(
                    "rpc.queue_capacity cannot be 0".into(),
                ));
            }
            if self.rpc.client_ttl.is_zero() || self.rpc.reap_interval.is_zero() {
                return Err(ConfigError::InvalidTimeout(
                    "rpc.client_ttl and rpc.reap_interval cannot be 0".into(),
                ));
            }
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_message_size cannot be 0".into(),
            ));
        }

        if self.reply_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "reply_timeout cannot be 0".into(),
            ));
        }

        if let Some(peer) = self.peers.iter().find(|p| p.address.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "peer address cannot be empty (secure: {})",
                peer.secure
            )));
        }

        Ok(())
    }

    /// Get server bind address
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Address announced to peers
    pub fn public_addr(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr().to_string())
    }
}

/// RPC bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Serve the JSON-RPC endpoint
    pub enabled: bool,
    /// JSON-RPC endpoint path
    pub path: String,
    /// Envelopes kept per polling client; the oldest is dropped beyond this
    pub queue_capacity: usize,
    /// Clients that have not called in this long are purged
    #[serde(with = "humantime_serde")]
    pub client_ttl: Duration,
    /// How often idle clients are looked for
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/rpc".to_string(),
            queue_capacity: 1024,
            client_ttl: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// A server to federate with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// `host:port` of the peer
    pub address: String,
    /// Dial over TLS
    #[serde(default)]
    pub secure: bool,
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Endpoint path must be absolute
    #[error("invalid endpoint path: {0}")]
    InvalidPath(String),
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
