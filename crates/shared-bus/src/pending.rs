//! Pending reply store for request/reply over the bus.
//!
//! Maps correlation ids to the waiter of a `*_wait_recv` call.
//!
//! Flow:
//! 1. Waiter calls `register()` and gets a correlation id plus a receiver
//! 2. Waiter subscribes to the correlation topic and publishes with `event_id`
//! 3. The topic handler calls `complete()` with the reply
//! 4. Waiter calls `wait()`, which resolves or times out and cancels

use dashmap::DashMap;
use shared_types::{BusError, CorrelationId, Envelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Default wait window for a correlation reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

struct PendingReply {
    sender: oneshot::Sender<Envelope>,
    created_at: Instant,
    label: String,
}

/// Statistics for the pending reply store
#[derive(Debug, Default)]
pub struct PendingStats {
    pub total_registered: AtomicU64,
    pub total_completed: AtomicU64,
    pub total_timeouts: AtomicU64,
    pub total_cancelled: AtomicU64,
}

/// Correlation id → waiting receiver.
pub struct PendingReplies {
    pending: DashMap<CorrelationId, PendingReply>,
    default_timeout: Duration,
    stats: Arc<PendingStats>,
}

impl PendingReplies {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            default_timeout,
            stats: Arc::new(PendingStats::default()),
        }
    }

    /// Register a waiter. `label` is only used for logging.
    pub fn register(&self, label: &str) -> (CorrelationId, oneshot::Receiver<Envelope>) {
        let correlation_id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingReply {
                sender: tx,
                created_at: Instant::now(),
                label: label.to_string(),
            },
        );
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);

        debug!(correlation_id = %correlation_id, label, "Registered pending reply");
        (correlation_id, rx)
    }

    /// Hand a reply to its waiter.
    ///
    /// Returns false if the id is unknown, already completed or expired.
    pub fn complete(&self, correlation_id: CorrelationId, reply: Envelope) -> bool {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            debug!(correlation_id = %correlation_id, "Reply for unknown or expired correlation id");
            return false;
        };

        let elapsed = pending.created_at.elapsed();
        if pending.sender.send(reply).is_ok() {
            self.stats.total_completed.fetch_add(1, Ordering::Relaxed);
            debug!(
                correlation_id = %correlation_id,
                label = pending.label,
                response_time_ms = elapsed.as_millis(),
                "Completed pending reply"
            );
            true
        } else {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Like [`PendingReplies::complete`], keyed by the topic string.
    pub fn complete_topic(&self, topic: &str, reply: Envelope) -> bool {
        match CorrelationId::parse(topic) {
            Ok(id) => self.complete(id, reply),
            Err(_) => false,
        }
    }

    /// Await the reply for `correlation_id`, at most `timeout` (or the default).
    pub async fn wait(
        &self,
        correlation_id: CorrelationId,
        rx: oneshot::Receiver<Envelope>,
        timeout: Option<Duration>,
    ) -> Result<Envelope, BusError> {
        let window = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.cancel(&correlation_id);
                Err(BusError::TransportClosed)
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %correlation_id,
                    timeout_ms = window.as_millis(),
                    "Pending reply timed out"
                );
                Err(BusError::Timeout {
                    event_id: correlation_id.to_string(),
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}
