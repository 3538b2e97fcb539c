//! # Error Types
//!
//! The error taxonomy shared by the bus, the server and the clients.

use thiserror::Error;

/// Errors surfaced by bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Point-to-point target has no registered identity or subscriber.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport upgrade or dial was rejected.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// Read or write on a connection (or queue) that is gone.
    #[error("transport closed")]
    TransportClosed,

    /// Identity already bound to another live connection.
    #[error("identity {0} already connected")]
    DuplicateIdentity(String),

    /// Connection already carries a different identity.
    #[error("connection already bound to {0}")]
    AlreadyBound(String),

    /// No correlation reply within the wait window.
    #[error("no reply for event {event_id}")]
    Timeout { event_id: String },

    /// Required field missing or payload of the wrong shape.
    #[error("{0}")]
    MalformedEnvelope(String),

    /// RPC queue at capacity; the oldest entry was dropped.
    #[error("queue overflow for {0}")]
    QueueOverflow(String),
}

impl BusError {
    /// Shorthand for a missing required field.
    pub fn missing(field: &str) -> Self {
        Self::MalformedEnvelope(format!("{field} missing"))
    }
}
