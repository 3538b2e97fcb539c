//! Polling bridge for clients that cannot hold a WebSocket.
//!
//! Every RPC client gets a session: a [`ConnectionSink`] registered on the bus
//! like a WebSocket connection. Deliveries land in the session's bounded
//! [`RpcQueue`] on the publisher's thread and are handed out one per `poll`.

use crate::domain::config::RpcConfig;
use crate::rpc::queue::RpcQueue;
use crate::server::{Server, WeakServer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use shared_bus::{ConnectionSink, DeliveryTarget, EnvelopeSink};
use shared_types::{BusError, Envelope, RpcRequest, RpcResponse};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct SessionState {
    queue: RpcQueue,
    topics: BTreeSet<String>,
    last_seen: Instant,
    closed: bool,
}

/// Bus-facing end of a session.
struct SessionInbox {
    identity: String,
    state: Arc<Mutex<SessionState>>,
}

impl EnvelopeSink for SessionInbox {
    fn push(&self, envelope: Envelope) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BusError::TransportClosed);
        }
        if let Some(evicted) = state.queue.push(envelope) {
            let overflow = BusError::QueueOverflow(self.identity.clone());
            warn!(
                error = %overflow,
                topic = ?evicted.topic,
                capacity = state.queue.capacity(),
                dropped = state.queue.dropped(),
                "Dropped oldest queued envelope"
            );
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

struct RpcSession {
    sink: ConnectionSink,
    state: Arc<Mutex<SessionState>>,
}

impl RpcSession {
    fn new(identity: &str, capacity: usize) -> Self {
        let state = Arc::new(Mutex::new(SessionState {
            queue: RpcQueue::new(capacity),
            topics: BTreeSet::new(),
            last_seen: Instant::now(),
            closed: false,
        }));
        let inbox = SessionInbox {
            identity: identity.to_string(),
            state: state.clone(),
        };
        Self {
            sink: ConnectionSink::direct(Arc::new(inbox)),
            state,
        }
    }

    fn touch(&self) {
        self.state.lock().last_seen = Instant::now();
    }

    /// Refuse further deliveries and drop whatever is queued.
    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        while state.queue.pop().is_some() {}
    }
}

/// Registry of polling clients, keyed by identity.
pub struct RpcBridge {
    config: RpcConfig,
    sessions: DashMap<String, Arc<RpcSession>>,
}

impl RpcBridge {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Bind `from` and allocate its queue if absent.
    pub fn ping(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let from = required(&req.from, "from")?;
        self.session(server, from)?;
        Ok(RpcResponse::with_data(Envelope::pong()))
    }

    /// Queue envelopes published on `topic` for `from`.
    pub fn subscribe(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let from = required(&req.from, "from")?;
        let topic = required(&req.topic, "topic")?;

        let session = self.session(server, from)?;
        if server.bus().subscribe_connection(topic, &session.sink, None) {
            session.state.lock().topics.insert(topic.to_string());
            debug!(%from, %topic, "RPC client subscribed");
            server.advertise_topics();
        }
        Ok(RpcResponse::ok())
    }

    /// Drop the subscription and its queued envelopes. The last topic takes
    /// the session and the identity binding with it.
    pub fn unsubscribe(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let from = required(&req.from, "from")?;
        let topic = required(&req.topic, "topic")?;
        let session = self.existing(from)?;

        let now_empty = {
            let mut state = session.state.lock();
            let purged = state.queue.purge_topic(topic);
            state.topics.remove(topic);
            state.last_seen = Instant::now();
            debug!(%from, %topic, purged, "RPC client unsubscribed");
            state.topics.is_empty()
        };
        server.bus().unsubscribe_connection(topic, session.sink.id());

        if now_empty {
            self.sessions.remove(from);
            session.close();
            server.bus().remove_connection(session.sink.id());
            debug!(%from, "RPC session closed with last topic");
        }
        server.advertise_topics();
        Ok(RpcResponse::ok())
    }

    pub fn publish(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let topic = required(&req.topic, "topic")?;
        let envelope = self.payload(req)?;
        server.publish_envelope(topic, envelope);
        Ok(RpcResponse::ok())
    }

    pub fn publish_to_id(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let id = required(&req.id, "id")?;
        let envelope = self.payload(req)?;
        server.route_to_id(id, envelope)?;
        Ok(RpcResponse::ok())
    }

    pub fn remove_topic(&self, server: &Server, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let topic = required(&req.topic, "topic")?;
        self.touch(req);
        server.remove_topic(topic);
        Ok(RpcResponse::ok())
    }

    /// Forget `topic` in every session after the server deleted it.
    pub(crate) fn forget_topic(&self, topic: &str) {
        for session in self.sessions.iter() {
            session.state.lock().topics.remove(topic);
        }
    }

    /// Dequeue exactly one envelope, or nothing.
    pub fn poll(&self, req: &RpcRequest) -> Result<RpcResponse, BusError> {
        let from = required(&req.from, "from")?;
        let session = self.existing(from)?;

        let mut state = session.state.lock();
        state.last_seen = Instant::now();
        Ok(match state.queue.pop() {
            Some(envelope) => RpcResponse::with_data(envelope),
            None => RpcResponse::ok(),
        })
    }

    /// Purge clients idle for longer than `client_ttl`. Returns their identities.
    pub fn reap(&self, server: &Server) -> Vec<String> {
        let ttl = self.config.client_ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().state.lock().last_seen.elapsed() > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        for identity in &expired {
            if let Some((_, session)) = self.sessions.remove(identity) {
                session.close();
                server.bus().remove_connection(session.sink.id());
                server.hooks().closed(identity);
                info!(%identity, "Idle RPC client reaped");
            }
        }
        if !expired.is_empty() {
            server.advertise_topics();
        }
        expired
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Envelopes waiting for `identity`.
    pub fn queued(&self, identity: &str) -> usize {
        self.sessions
            .get(identity)
            .map(|session| session.state.lock().queue.len())
            .unwrap_or(0)
    }

    fn session(&self, server: &Server, identity: &str) -> Result<Arc<RpcSession>, BusError> {
        match self.sessions.entry(identity.to_string()) {
            Entry::Occupied(entry) => {
                entry.get().touch();
                Ok(entry.get().clone())
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(RpcSession::new(identity, self.config.queue_capacity));
                server
                    .bus()
                    .register_identity(identity, DeliveryTarget::Connection(session.sink.clone()))?;
                info!(%identity, "RPC client registered");
                Ok(slot.insert(session).clone())
            }
        }
    }

    fn existing(&self, identity: &str) -> Result<Arc<RpcSession>, BusError> {
        self.sessions
            .get(identity)
            .map(|session| session.value().clone())
            .ok_or_else(|| BusError::NotFound(format!("rpc client {identity}")))
    }

    fn touch(&self, req: &RpcRequest) {
        if let Some(session) = req.from.as_deref().and_then(|from| self.sessions.get(from)) {
            session.touch();
        }
    }

    /// Envelope to publish: `data` (string or object) with `from` filled in.
    fn payload(&self, req: &RpcRequest) -> Result<Envelope, BusError> {
        let data = req.data.clone().ok_or_else(|| BusError::missing("data"))?;
        let mut envelope = Envelope::from_payload(data)?;
        if envelope.from.is_none() {
            envelope.from = req.from.clone();
        }
        self.touch(req);
        Ok(envelope)
    }
}

/// Periodically reap idle clients until the server is dropped.
pub(crate) fn spawn_reaper(server: WeakServer, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(server) = server.upgrade() else {
                break;
            };
            server.rpc().reap(&server);
        }
    })
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, BusError> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BusError::missing(name))
}
