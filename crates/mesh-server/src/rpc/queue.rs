//! Bounded per-client envelope queue with drop-oldest overflow.

use shared_types::Envelope;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct RpcQueue {
    envelopes: VecDeque<Envelope>,
    capacity: usize,
    dropped: u64,
}

impl RpcQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            envelopes: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append `envelope`. Returns the evicted oldest envelope when full.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.envelopes.len() >= self.capacity {
            self.dropped += 1;
            self.envelopes.pop_front()
        } else {
            None
        };
        self.envelopes.push_back(envelope);
        evicted
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.envelopes.pop_front()
    }

    /// Drop queued envelopes published on `topic`.
    pub fn purge_topic(&mut self, topic: &str) -> usize {
        let before = self.envelopes.len();
        self.envelopes
            .retain(|env| env.topic.as_deref() != Some(topic));
        before - self.envelopes.len()
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Envelopes evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
