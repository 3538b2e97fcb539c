//! # Bus
//!
//! The subscriber registry. Topics map to ordered subscriber lists, identities
//! map to a single delivery target. Both live in `DashMap`s so every
//! operation locks one shard at most and never holds a lock while a handler
//! runs.
//!
//! Delivery never blocks the publisher: envelopes are pushed onto unbounded
//! per-subscriber channels, and each in-process subscriber has its own task
//! that invokes the handler. Order is FIFO per subscriber.

use crate::subscriber::{ConnectionId, ConnectionSink, DeliveryTarget, Subscriber, SubscriberId};
use crate::subscription::Subscription;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared_types::{BusError, Envelope};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Shared registry state behind [`Bus`].
#[derive(Debug, Default)]
pub(crate) struct Registry {
    topics: DashMap<String, Vec<Subscriber>>,
    identities: DashMap<String, DeliveryTarget>,
    next_subscriber: AtomicU64,
    published: AtomicU64,
}

impl Registry {
    fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn remove_subscriber(&self, topic: &str, id: SubscriberId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
        }
    }

    fn connection_has_topics(&self, connection: ConnectionId) -> bool {
        self.topics.iter().any(|entry| {
            entry
                .value()
                .iter()
                .any(|s| s.target.connection_id() == Some(connection))
        })
    }

    fn release_connection_identity(&self, connection: ConnectionId) -> Option<String> {
        let identity = self
            .identities
            .iter()
            .find(|entry| entry.value().connection_id() == Some(connection))
            .map(|entry| entry.key().clone())?;
        self.identities
            .remove_if(&identity, |_, target| {
                target.connection_id() == Some(connection)
            })
            .map(|(identity, _)| identity)
    }
}

/// In-process publish/subscribe registry.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    registry: Arc<Registry>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler on `topic`.
    ///
    /// Must be called inside a Tokio runtime: the handler runs on its own task.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, None, None, handler)
    }

    /// Like [`Bus::subscribe`], with a hook invoked before each handler call.
    pub fn subscribe_with<F, B>(&self, topic: &str, handler: F, before: B) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
        B: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, None, Some(Box::new(before)), handler)
    }

    /// Register a handler reachable through [`Bus::send_to_named`].
    pub fn subscribe_named<F>(&self, topic: &str, name: &str, handler: F) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
    {
        self.subscribe_inner(topic, Some(name.to_string()), None, handler)
    }

    #[allow(clippy::type_complexity)]
    fn subscribe_inner<F>(
        &self,
        topic: &str,
        name: Option<String>,
        before: Option<Box<dyn Fn(&Envelope) + Send + Sync>>,
        handler: F,
    ) -> Subscription
    where
        F: Fn(Envelope, &Subscription) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let id = self.registry.next_id();
        let active = Arc::new(AtomicBool::new(true));

        self.registry
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                topic: topic.to_string(),
                target: DeliveryTarget::Queue(tx),
                name: name.clone(),
                active: active.clone(),
            });

        let subscription = Subscription::new(
            id,
            topic.to_string(),
            name,
            active,
            Arc::downgrade(&self.registry),
        );

        let handle = subscription.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if !handle.is_active() {
                    break;
                }
                if let Some(before) = &before {
                    before(&envelope);
                }
                handler(envelope, &handle);
            }
            trace!(topic = %handle.topic(), subscriber = id.0, "Subscriber task finished");
        });

        debug!(topic = %topic, subscriber = id.0, "New subscription created");
        subscription
    }

    /// Broadcast to every subscriber of `topic`.
    ///
    /// Stamps `topic` on the envelope and returns the number of subscribers it
    /// was handed to. No subscribers is not an error.
    pub fn publish(&self, topic: &str, mut envelope: Envelope) -> usize {
        envelope.topic = Some(topic.to_string());
        self.registry.published.fetch_add(1, Ordering::Relaxed);

        let snapshot = match self.registry.topics.get(topic) {
            Some(subscribers) => subscribers.clone(),
            None => {
                debug!(topic = %topic, "Envelope dropped (no subscribers)");
                return 0;
            }
        };

        let mut delivered = 0;
        for subscriber in snapshot.iter().filter(|s| s.is_active()) {
            match subscriber.target.deliver(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(
                    topic = %topic,
                    subscriber = subscriber.id.0,
                    error = %e,
                    "Skipping closed subscriber"
                ),
            }
        }

        debug!(topic = %topic, receivers = delivered, "Envelope published");
        delivered
    }

    /// Deliver to the target bound to `identity`, stamping `to_id`.
    pub fn publish_to_id(&self, identity: &str, mut envelope: Envelope) -> Result<(), BusError> {
        let target = self
            .registry
            .identities
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BusError::NotFound(identity.to_string()))?;

        envelope.to_id = Some(identity.to_string());
        target.deliver(envelope)?;
        debug!(to_id = %identity, "Envelope delivered to identity");
        Ok(())
    }

    /// Delete `topic` and every subscriber on it. Returns how many were removed.
    pub fn remove_topic(&self, topic: &str) -> usize {
        match self.registry.topics.remove(topic) {
            Some((_, subscribers)) => {
                for subscriber in &subscribers {
                    subscriber.deactivate();
                }
                debug!(topic = %topic, removed = subscribers.len(), "Topic removed");
                subscribers.len()
            }
            None => 0,
        }
    }

    /// Deliver to subscribers registered under `name` (bare or `topic:name`).
    pub fn send_to_named(&self, name: &str, mut envelope: Envelope) -> usize {
        envelope.name = Some(name.to_string());

        let targets: Vec<Subscriber> = self
            .registry
            .topics
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|s| s.is_active() && s.matches_name(name))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        targets
            .iter()
            .filter(|s| s.target.deliver(envelope.clone()).is_ok())
            .count()
    }

    /// Register a live connection on `topic`. Returns `false` if it already was.
    pub fn subscribe_connection(
        &self,
        topic: &str,
        sink: &ConnectionSink,
        name: Option<String>,
    ) -> bool {
        let mut subscribers = self.registry.topics.entry(topic.to_string()).or_default();
        if subscribers
            .iter()
            .any(|s| s.target.connection_id() == Some(sink.id()))
        {
            return false;
        }
        subscribers.push(Subscriber {
            id: self.registry.next_id(),
            topic: topic.to_string(),
            target: DeliveryTarget::Connection(sink.clone()),
            name,
            active: Arc::new(AtomicBool::new(true)),
        });
        debug!(topic = %topic, connection = %sink.id(), "Connection subscribed");
        true
    }

    /// Remove a connection from `topic`.
    ///
    /// When the connection is left with no topic at all, its identity binding
    /// is released too.
    pub fn unsubscribe_connection(&self, topic: &str, connection: ConnectionId) -> bool {
        let removed = match self.registry.topics.get_mut(topic) {
            Some(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.target.connection_id() != Some(connection));
                subscribers.len() != before
            }
            None => false,
        };

        if removed && !self.registry.connection_has_topics(connection) {
            if let Some(identity) = self.registry.release_connection_identity(connection) {
                debug!(%identity, %connection, "Identity released with last topic");
            }
        }
        removed
    }

    /// Purge a closed connection from every topic and release its identity.
    pub fn remove_connection(&self, connection: ConnectionId) -> Option<String> {
        for mut entry in self.registry.topics.iter_mut() {
            entry
                .value_mut()
                .retain(|s| s.target.connection_id() != Some(connection));
        }
        let identity = self.registry.release_connection_identity(connection);
        debug!(%connection, identity = ?identity, "Connection removed");
        identity
    }

    /// Bind `identity` to `target`.
    ///
    /// Re-binding the same target is a no-op; a binding whose receiver is gone
    /// is replaced. Anything else is [`BusError::DuplicateIdentity`]. A
    /// connection carries at most one identity: binding it under a second
    /// name is [`BusError::AlreadyBound`].
    pub fn register_identity(&self, identity: &str, target: DeliveryTarget) -> Result<(), BusError> {
        if let Some(connection) = target.connection_id() {
            if let Some(bound) = self.identity_of(connection).filter(|bound| bound != identity) {
                return Err(BusError::AlreadyBound(bound));
            }
        }
        match self.registry.identities.entry(identity.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().same_target(&target) {
                    Ok(())
                } else if existing.get().is_closed() {
                    existing.insert(target);
                    Ok(())
                } else {
                    Err(BusError::DuplicateIdentity(identity.to_string()))
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(target);
                debug!(%identity, "Identity registered");
                Ok(())
            }
        }
    }

    pub fn release_identity(&self, identity: &str) -> bool {
        self.registry.identities.remove(identity).is_some()
    }

    /// Identity bound to a connection, if any.
    pub fn identity_of(&self, connection: ConnectionId) -> Option<String> {
        self.registry
            .identities
            .iter()
            .find(|entry| entry.value().connection_id() == Some(connection))
            .map(|entry| entry.key().clone())
    }

    pub fn has_identity(&self, identity: &str) -> bool {
        self.registry.identities.contains_key(identity)
    }

    /// All bound identities.
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .identities
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// All topic keys, including ones whose subscribers are all gone.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .registry
            .topics
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Topics that currently have at least one subscriber.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .registry
            .topics
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .topics
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Total publishes attempted.
    pub fn envelopes_published(&self) -> u64 {
        self.registry.published.load(Ordering::Relaxed)
    }
}
