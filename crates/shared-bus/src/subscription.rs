//! # Subscription Handle
//!
//! Returned by [`Bus::subscribe`](crate::Bus::subscribe) and also passed to
//! the handler itself, so a handler can unsubscribe from inside its own
//! invocation (the correlation wait does exactly that).

use crate::bus::Registry;
use crate::subscriber::SubscriberId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Handle to an in-process subscription.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriberId,
    topic: String,
    name: Option<String>,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn new(
        id: SubscriberId,
        topic: String,
        name: Option<String>,
        active: Arc<AtomicBool>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            id,
            topic,
            name,
            active,
            registry,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// False once unsubscribed or once the topic was removed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this subscriber from its topic.
    ///
    /// Idempotent. Returns `true` only for the call that actually removed it.
    /// Once this returns, the handler is not invoked again.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_subscriber(&self.topic, self.id);
        }
        debug!(topic = %self.topic, subscriber = self.id.0, "Unsubscribed");
        true
    }
}
