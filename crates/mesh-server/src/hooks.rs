//! Server callbacks.

use axum::http::HeaderMap;
use shared_bus::ConnectionId;
use shared_types::Envelope;
use std::fmt;
use std::sync::Arc;

/// Decides whether a WebSocket upgrade is accepted.
pub type UpgradeHook = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;
/// Inspects every inbound envelope; `false` closes the connection.
pub type DataHook = Arc<dyn Fn(&Envelope, ConnectionId) -> bool + Send + Sync>;
/// Receives envelopes addressed to the server's own identity.
pub type IdHook = Arc<dyn Fn(Envelope) + Send + Sync>;
/// Receives payloads relayed from other servers.
pub type ServerDataHook = Arc<dyn Fn(Envelope) + Send + Sync>;
/// Called with the identity of a connection or RPC client that went away.
pub type CloseHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional server callbacks. All default to no-ops.
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub before_upgrade: Option<UpgradeHook>,
    pub on_data: Option<DataHook>,
    pub on_id: Option<IdHook>,
    pub on_server_data: Option<ServerDataHook>,
    pub on_close: Option<CloseHook>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_upgrade<F>(mut self, f: F) -> Self
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.before_upgrade = Some(Arc::new(f));
        self
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Envelope, ConnectionId) -> bool + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_id<F>(mut self, f: F) -> Self
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.on_id = Some(Arc::new(f));
        self
    }

    pub fn on_server_data<F>(mut self, f: F) -> Self
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.on_server_data = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub(crate) fn allow_upgrade(&self, headers: &HeaderMap) -> bool {
        self.before_upgrade
            .as_ref()
            .map_or(true, |gate| gate(headers))
    }

    pub(crate) fn accept_data(&self, envelope: &Envelope, connection: ConnectionId) -> bool {
        self.on_data
            .as_ref()
            .map_or(true, |hook| hook(envelope, connection))
    }

    pub(crate) fn closed(&self, identity: &str) {
        if let Some(hook) = &self.on_close {
            hook(identity);
        }
    }
}

impl fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHooks")
            .field("before_upgrade", &self.before_upgrade.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_id", &self.on_id.is_some())
            .field("on_server_data", &self.on_server_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}
