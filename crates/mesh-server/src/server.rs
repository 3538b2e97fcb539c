//! The bus server: routing entry points, federation and the HTTP surface.
//!
//! ```text
//!   WebSocket ──┐                         ┌──▶ in-process subscribers
//!               ├──▶ Server ──▶ Bus ──────┼──▶ WebSocket connections
//!   JSON-RPC  ──┘       │                 └──▶ RPC queues
//!                       └──▶ Federation ──────▶ peer servers
//! ```

use crate::domain::config::ServerConfig;
use crate::domain::error::ServerError;
use crate::federation::Federation;
use crate::hooks::ServerHooks;
use crate::rpc::{bridge, handle_json_rpc, RpcBridge};
use crate::ws::ws_upgrade;
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use mesh_client::{retry_every, Client, ClientOptions, DEFAULT_RESTART_EVERY};
use serde_json::Value;
use shared_bus::{Bus, PendingReplies, Subscription};
use shared_types::{Action, BusError, Envelope};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

struct ServerInner {
    id: String,
    config: ServerConfig,
    bus: Bus,
    pending: Arc<PendingReplies>,
    hooks: ServerHooks,
    federation: Federation,
    rpc: RpcBridge,
}

/// A bus server. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Non-owning handle for background tasks and peer-link callbacks.
#[derive(Clone)]
pub struct WeakServer {
    inner: Weak<ServerInner>,
}

impl WeakServer {
    pub fn upgrade(&self) -> Option<Server> {
        self.inner.upgrade().map(|inner| Server { inner })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("addr", &self.addr())
            .field("hooks", &self.inner.hooks)
            .finish()
    }
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_hooks(config, ServerHooks::default())
    }

    pub fn with_hooks(config: ServerConfig, hooks: ServerHooks) -> Result<Self, ServerError> {
        config.validate()?;

        let id = if config.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.id.clone()
        };

        Ok(Self {
            inner: Arc::new(ServerInner {
                pending: Arc::new(PendingReplies::new(config.reply_timeout)),
                federation: Federation::new(config.public_addr()),
                rpc: RpcBridge::new(config.rpc.clone()),
                bus: Bus::new(),
                id,
                config,
                hooks,
            }),
        })
    }

    /// Bind the configured address and build the server.
    ///
    /// With port 0 the advertised address uses the port actually bound.
    pub async fn bind(
        mut config: ServerConfig,
        hooks: ServerHooks,
    ) -> Result<(Self, TcpListener), ServerError> {
        let listener = TcpListener::bind(config.bind_addr())
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", config.bind_addr(), e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        config.port = local.port();

        let server = Self::with_hooks(config, hooks)?;
        Ok((server, listener))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Address advertised to peers.
    pub fn addr(&self) -> &str {
        self.inner.federation.addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn hooks(&self) -> &ServerHooks {
        &self.inner.hooks
    }

    pub fn federation(&self) -> &Federation {
        &self.inner.federation
    }

    pub fn rpc(&self) -> &RpcBridge {
        &self.inner.rpc
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // IN-PROCESS SUBSCRIBERS
    // ═══════════════════════════════════════════════════════════════════

    /// Register an in-process handler on `topic` and advertise it to peers.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
    {
        let subscription = self.bus().subscribe(topic, handler);
        self.advertise_topics();
        subscription
    }

    /// Register a handler reachable through [`Server::send_to_named`].
    pub fn subscribe_named<F>(&self, topic: &str, name: &str, handler: F) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
    {
        let subscription = self.bus().subscribe_named(topic, name, handler);
        self.advertise_topics();
        subscription
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = subscription.unsubscribe();
        if removed {
            self.advertise_topics();
        }
        removed
    }

    // ═══════════════════════════════════════════════════════════════════
    // ROUTING
    // ═══════════════════════════════════════════════════════════════════

    /// Publish `data` (object or string) on `topic`, locally and to peers.
    ///
    /// Returns the number of local subscribers reached.
    pub fn publish(&self, topic: &str, data: Value) -> Result<usize, ServerError> {
        let envelope = Envelope::from_payload(data)?;
        Ok(self.publish_envelope(topic, envelope))
    }

    /// Route an envelope: local delivery, then forwarding to peers claiming
    /// the topic unless it already came from a peer.
    pub fn publish_envelope(&self, topic: &str, mut envelope: Envelope) -> usize {
        if envelope.from.is_none() {
            envelope.from = Some(self.id().to_string());
        }
        let forwarded = self.federation().forward_publish(topic, &envelope);
        let delivered = self.bus().publish(topic, envelope);
        if forwarded > 0 {
            debug!(topic, local = delivered, peers = forwarded, "Envelope routed");
        }
        delivered
    }

    /// Deliver `data` to identity `id`: this server, a local connection or
    /// RPC client, or a peer hosting it.
    pub fn publish_to_id(&self, id: &str, data: Value) -> Result<(), ServerError> {
        let envelope = Envelope::from_payload(data)?;
        self.route_to_id(id, envelope).map_err(ServerError::from)
    }

    pub fn route_to_id(&self, id: &str, mut envelope: Envelope) -> Result<(), BusError> {
        if envelope.from.is_none() {
            envelope.from = Some(self.id().to_string());
        }
        if id == self.id() {
            self.deliver_own(envelope);
            return Ok(());
        }
        match self.bus().publish_to_id(id, envelope.clone()) {
            Err(BusError::NotFound(_)) => self.federation().forward_to_id(id, &envelope),
            other => other,
        }
    }

    /// Envelope addressed to this server: acknowledge, then hand to `on_id`.
    pub(crate) fn deliver_own(&self, mut envelope: Envelope) {
        envelope.to_id = None;
        if let Some(event_id) = envelope.event_id.clone() {
            self.publish_envelope(&event_id, Envelope::ack(self.id()));
        }
        match &self.hooks().on_id {
            Some(on_id) => on_id(envelope),
            None => debug!(from = ?envelope.from, "Envelope for server id dropped (no on_id hook)"),
        }
    }

    /// Deliver to subscribers named `name` (bare or `topic:name`).
    pub fn send_to_named(&self, name: &str, data: Value) -> Result<usize, ServerError> {
        let envelope = Envelope::from_payload(data)?;
        Ok(self.send_to_named_envelope(name, envelope))
    }

    pub(crate) fn send_to_named_envelope(&self, name: &str, mut envelope: Envelope) -> usize {
        if envelope.from.is_none() {
            envelope.from = Some(self.id().to_string());
        }
        self.bus().send_to_named(name, envelope)
    }

    /// Delete `topic` for every subscriber and withdraw it from peers.
    pub fn remove_topic(&self, topic: &str) -> usize {
        let removed = self.bus().remove_topic(topic);
        self.rpc().forget_topic(topic);
        if removed > 0 {
            let withdraw = Envelope::action(Action::RemoveNodeTopic)
                .with_addr(self.addr())
                .with_topic(topic);
            self.federation().broadcast(&withdraw);
        }
        removed
    }

    /// Topics with at least one local subscriber.
    pub fn all_topics(&self) -> Vec<String> {
        self.bus().active_topics()
    }

    // ═══════════════════════════════════════════════════════════════════
    // REQUEST / REPLY
    // ═══════════════════════════════════════════════════════════════════

    /// Publish on `topic` and wait for the first acknowledgement.
    pub async fn publish_wait(&self, topic: &str, data: Value) -> Result<Envelope, ServerError> {
        self.wait_reply(topic, data, |server, env| {
            server.publish_envelope(topic, env);
            Ok(())
        })
        .await
        .1
    }

    /// Send to `id` and wait for its acknowledgement.
    pub async fn publish_to_id_wait(&self, id: &str, data: Value) -> Result<Envelope, ServerError> {
        self.wait_reply(id, data, |server, env| Ok(server.route_to_id(id, env)?))
            .await
            .1
    }

    /// Callback form of [`Server::publish_wait`]: exactly one of `on_recv`
    /// and `on_expire(event_id, topic)` is called.
    pub async fn publish_wait_recv<R, E>(
        &self,
        topic: &str,
        data: Value,
        on_recv: R,
        on_expire: E,
    ) -> Result<(), ServerError>
    where
        R: FnOnce(Envelope),
        E: FnOnce(&str, &str),
    {
        let (event_id, outcome) = self
            .wait_reply(topic, data, |server, env| {
                server.publish_envelope(topic, env);
                Ok(())
            })
            .await;
        settle(outcome, &event_id, topic, on_recv, on_expire)
    }

    /// Callback form of [`Server::publish_to_id_wait`].
    pub async fn publish_to_id_wait_recv<R, E>(
        &self,
        id: &str,
        data: Value,
        on_recv: R,
        on_expire: E,
    ) -> Result<(), ServerError>
    where
        R: FnOnce(Envelope),
        E: FnOnce(&str, &str),
    {
        let (event_id, outcome) = self
            .wait_reply(id, data, |server, env| Ok(server.route_to_id(id, env)?))
            .await;
        settle(outcome, &event_id, id, on_recv, on_expire)
    }

    pub fn pending_replies(&self) -> usize {
        self.inner.pending.pending_count()
    }

    async fn wait_reply<S>(
        &self,
        label: &str,
        data: Value,
        send: S,
    ) -> (String, Result<Envelope, ServerError>)
    where
        S: FnOnce(&Self, Envelope) -> Result<(), ServerError>,
    {
        let (correlation_id, rx) = self.inner.pending.register(label);
        let event_id = correlation_id.topic();

        let outcome = match Envelope::from_payload(data) {
            Err(e) => Err(e.into()),
            Ok(mut payload) => {
                payload.event_id = Some(event_id.clone());
                if payload.from.is_none() {
                    payload.from = Some(self.id().to_string());
                }

                // Advertised like any topic so replies can come back from peers
                let pending = self.inner.pending.clone();
                self.subscribe(&event_id, move |reply, _| {
                    pending.complete(correlation_id, reply);
                });

                match send(self, payload) {
                    Ok(()) => self
                        .inner
                        .pending
                        .wait(correlation_id, rx, None)
                        .await
                        .map_err(ServerError::from),
                    Err(e) => Err(e),
                }
            }
        };

        self.inner.pending.cancel(&correlation_id);
        self.remove_topic(&event_id);
        (event_id, outcome)
    }

    // ═══════════════════════════════════════════════════════════════════
    // FEDERATION
    // ═══════════════════════════════════════════════════════════════════

    /// Link to the server at `addr` and exchange topic directories.
    pub async fn join_peer(&self, addr: &str, secure: bool) -> Result<(), ServerError> {
        if self.federation().is_self(addr) {
            return Ok(());
        }

        if !self.federation().is_linked(addr) {
            let token = self.federation().next_token();
            let link = self.dial_peer(addr, secure, token).await?;
            if self.federation().insert_link(addr, token, link) {
                info!(peer = %addr, "Joined peer");
            }
        }

        let hello = Envelope::action(Action::ServerSub).with_addr(self.addr());
        self.federation()
            .send(addr, hello)
            .map_err(|e| unreachable_peer(addr, e))?;
        self.send_topics_to(addr);
        Ok(())
    }

    /// A peer announced itself: dial back if needed, answer with our topics.
    pub(crate) fn accept_peer(&self, addr: &str, secure: bool) {
        if self.federation().is_self(addr) {
            return;
        }
        let server = self.clone();
        let addr = addr.to_string();
        tokio::spawn(async move {
            if server.federation().is_linked(&addr) {
                server.send_topics_to(&addr);
            } else if let Err(e) = server.join_peer(&addr, secure).await {
                warn!(peer = %addr, error = %e, "Dial back to peer failed");
            }
        });
    }

    /// Join every configured peer in the background, retrying until linked.
    pub fn join_configured_peers(&self) {
        for peer in self.config().peers.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                let joined = retry_every(DEFAULT_RESTART_EVERY, None, || {
                    server.join_peer(&peer.address, peer.secure)
                })
                .await;
                if let Err(e) = joined {
                    warn!(peer = %peer.address, error = %e, "Could not join peer");
                }
            });
        }
    }

    /// Relay `data` to the server at `addr` as a `server_message`.
    pub async fn publish_to_server(
        &self,
        addr: &str,
        data: Value,
        secure: bool,
    ) -> Result<(), ServerError> {
        if self.federation().is_self(addr) {
            self.receive_server_data(Envelope::from_payload(data)?);
            return Ok(());
        }
        if !self.federation().is_linked(addr) {
            self.join_peer(addr, secure).await?;
        }

        let message = Envelope::action(Action::ServerMessage)
            .with_addr(addr)
            .with_data(data)
            .with_from(self.id());
        self.federation()
            .send(addr, message)
            .map_err(|e| unreachable_peer(addr, e))
    }

    pub(crate) fn receive_server_data(&self, envelope: Envelope) {
        match &self.hooks().on_server_data {
            Some(hook) => hook(envelope),
            None => debug!(from = ?envelope.from, "Server data dropped (no on_server_data hook)"),
        }
    }

    /// Send the local topic directory to every peer.
    pub fn advertise_topics(&self) {
        if self.federation().linked_peers().is_empty() {
            return;
        }
        let topics = self.topics_envelope();
        self.federation().broadcast(&topics);
    }

    fn send_topics_to(&self, addr: &str) {
        if let Err(e) = self.federation().send(addr, self.topics_envelope()) {
            warn!(peer = %addr, error = %e, "Could not advertise topics");
        }
    }

    fn topics_envelope(&self) -> Envelope {
        self.federation()
            .topics_envelope(self.all_topics(), self.bus().identities())
    }

    async fn dial_peer(&self, addr: &str, secure: bool, token: u64) -> Result<Client, ServerError> {
        let on_id = self.downgrade();
        let on_close = self.downgrade();
        let peer = addr.to_string();

        let options = ClientOptions::new(addr)
            .with_id(self.id())
            .secure(secure)
            .reply_timeout(self.config().reply_timeout)
            .on_id(move |envelope| {
                if let Some(server) = on_id.upgrade() {
                    server.deliver_own(envelope);
                }
            })
            .on_close(move || {
                if let Some(server) = on_close.upgrade() {
                    server.federation().drop_link_if(&peer, token);
                }
            });

        Client::connect(options)
            .await
            .map_err(|e| unreachable_peer(addr, e))
    }

    // ═══════════════════════════════════════════════════════════════════
    // HTTP SURFACE
    // ═══════════════════════════════════════════════════════════════════

    /// WebSocket endpoint, JSON-RPC endpoint (when enabled) and `/health`.
    pub fn router(&self) -> Router {
        let config = self.config();
        let mut router = Router::new()
            .route(&config.ws_path, get(ws_upgrade))
            .route("/health", get(health_check));
        if config.rpc.enabled {
            router = router.route(&config.rpc.path, post(handle_json_rpc));
        }

        router
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        info!(
            id = %self.id(),
            listen = %local,
            advertise = %self.addr(),
            ws_path = %self.config().ws_path,
            rpc = self.config().rpc.enabled,
            "Bus server listening"
        );

        let reaper = self.config().rpc.enabled.then(|| {
            bridge::spawn_reaper(self.downgrade(), self.config().rpc.reap_interval)
        });
        self.join_configured_peers();

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()));

        if let Some(reaper) = reaper {
            reaper.abort();
        }
        for peer in self.federation().linked_peers() {
            self.federation().drop_link(&peer);
        }
        info!(id = %self.id(), "Bus server stopped");
        result
    }
}

/// Health check endpoint
async fn health_check(State(server): State<Server>) -> impl IntoResponse {
    let stats = server.inner.pending.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "meshbus",
        "version": env!("CARGO_PKG_VERSION"),
        "id": server.id(),
        "addr": server.addr(),
        "topics": server.all_topics().len(),
        "rpc_clients": server.rpc().session_count(),
        "peers": server.federation().linked_peers(),
        "replies": {
            "pending": server.pending_replies(),
            "timeouts": stats.total_timeouts.load(Ordering::Relaxed),
            "completed": stats.total_completed.load(Ordering::Relaxed),
        },
    }))
}

fn unreachable_peer(addr: &str, error: impl std::fmt::Display) -> ServerError {
    ServerError::PeerUnreachable {
        addr: addr.to_string(),
        reason: error.to_string(),
    }
}

fn settle<R, E>(
    outcome: Result<Envelope, ServerError>,
    event_id: &str,
    target: &str,
    on_recv: R,
    on_expire: E,
) -> Result<(), ServerError>
where
    R: FnOnce(Envelope),
    E: FnOnce(&str, &str),
{
    match outcome {
        Ok(reply) => {
            on_recv(reply);
            Ok(())
        }
        Err(ServerError::Bus(BusError::Timeout { .. })) => {
            on_expire(event_id, target);
            Ok(())
        }
        Err(e) => {
            on_expire(event_id, target);
            Err(e)
        }
    }
}
