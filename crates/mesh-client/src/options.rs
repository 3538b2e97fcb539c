//! Client options.

use crate::error::ClientError;
use shared_bus::DEFAULT_REPLY_TIMEOUT;
use shared_types::{Envelope, DEFAULT_WS_PATH};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default delay between reconnect attempts.
pub const DEFAULT_RESTART_EVERY: Duration = Duration::from_secs(10);

/// Default RPC poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default RPC endpoint path.
pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Called with every inbound envelope before any routing.
pub type DataHook = Arc<dyn Fn(&Envelope) + Send + Sync>;
/// Called with envelopes addressed to this client's identity.
pub type IdHook = Arc<dyn Fn(Envelope) + Send + Sync>;
/// Called when an established connection ends.
pub type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Callbacks shared by both client flavours.
#[derive(Clone, Default)]
pub struct ClientHooks {
    pub on_id: Option<IdHook>,
    pub on_data: Option<DataHook>,
    pub on_close: Option<CloseHook>,
}

impl fmt::Debug for ClientHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHooks")
            .field("on_id", &self.on_id.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

fn random_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn endpoint(scheme: &str, address: &str, path: &str) -> Result<Url, ClientError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Url::parse(&format!("{scheme}://{address}{path}"))
        .map_err(|e| ClientError::InvalidAddress(format!("{address}: {e}")))
}

macro_rules! hook_builders {
    () => {
        pub fn on_id<F>(mut self, f: F) -> Self
        where
            F: Fn(Envelope) + Send + Sync + 'static,
        {
            self.hooks.on_id = Some(Arc::new(f));
            self
        }

        pub fn on_data<F>(mut self, f: F) -> Self
        where
            F: Fn(&Envelope) + Send + Sync + 'static,
        {
            self.hooks.on_data = Some(Arc::new(f));
            self
        }

        pub fn on_close<F>(mut self, f: F) -> Self
        where
            F: Fn() + Send + Sync + 'static,
        {
            self.hooks.on_close = Some(Arc::new(f));
            self
        }

        pub fn with_id(mut self, id: impl Into<String>) -> Self {
            self.id = id.into();
            self
        }

        pub fn secure(mut self, secure: bool) -> Self {
            self.secure = secure;
            self
        }

        pub fn autorestart(mut self, restart_every: Duration) -> Self {
            self.autorestart = true;
            self.restart_every = restart_every;
            self
        }

        pub fn reply_timeout(mut self, timeout: Duration) -> Self {
            self.reply_timeout = timeout;
            self
        }
    };
}

/// Options of a WebSocket [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identity announced in `ping`. Random when not set.
    pub id: String,
    /// `host:port` of the server.
    pub address: String,
    pub path: String,
    /// Dial `wss://` instead of `ws://`.
    pub secure: bool,
    pub hooks: ClientHooks,
    /// Reconnect after dial or read failures.
    pub autorestart: bool,
    pub restart_every: Duration,
    pub reply_timeout: Duration,
}

impl ClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: random_id(),
            address: address.into(),
            path: DEFAULT_WS_PATH.to_string(),
            secure: false,
            hooks: ClientHooks::default(),
            autorestart: false,
            restart_every: DEFAULT_RESTART_EVERY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    hook_builders!();

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// `ws[s]://address/path`
    pub fn url(&self) -> Result<Url, ClientError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        endpoint(scheme, &self.address, &self.path)
    }
}

/// Options of an [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub id: String,
    pub address: String,
    pub path: String,
    pub secure: bool,
    pub hooks: ClientHooks,
    pub autorestart: bool,
    pub restart_every: Duration,
    pub poll_interval: Duration,
    pub reply_timeout: Duration,
    /// Timeout of a single HTTP call.
    pub request_timeout: Duration,
}

impl RpcClientOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            id: random_id(),
            address: address.into(),
            path: DEFAULT_RPC_PATH.to_string(),
            secure: false,
            hooks: ClientHooks::default(),
            autorestart: false,
            restart_every: DEFAULT_RESTART_EVERY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            request_timeout: Duration::from_secs(5),
        }
    }

    hook_builders!();

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// `http[s]://address/path`
    pub fn url(&self) -> Result<Url, ClientError> {
        let scheme = if self.secure { "https" } else { "http" };
        endpoint(scheme, &self.address, &self.path)
    }
}
