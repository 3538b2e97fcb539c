//! # Subscribers
//!
//! A subscriber is one registration of a delivery target on a topic. The
//! target is either an in-process queue drained by a dedicated task, or a
//! live connection whose writer task serializes envelopes onto the socket.

use shared_types::{BusError, Envelope};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one subscriber registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

/// Identifies one live connection (WebSocket or RPC identity pump).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receiver that takes envelopes synchronously instead of through a channel.
///
/// Used by connections that buffer deliveries themselves, such as the
/// bounded queue of a polling client.
pub trait EnvelopeSink: Send + Sync + 'static {
    fn push(&self, envelope: Envelope) -> Result<(), BusError>;

    fn is_closed(&self) -> bool;
}

#[derive(Clone)]
enum Outbound {
    Channel(mpsc::UnboundedSender<Envelope>),
    Direct(Arc<dyn EnvelopeSink>),
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Channel"),
            Self::Direct(_) => f.write_str("Direct"),
        }
    }
}

/// Outbound side of a live connection.
///
/// Cloning shares the same receiver; equality of sinks is equality of ids.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    id: ConnectionId,
    outbound: Outbound,
}

impl ConnectionSink {
    /// Wrap the sender drained by a connection's writer task.
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound: Outbound::Channel(tx),
        }
    }

    /// Deliver straight into `sink` on the publisher's thread.
    pub fn direct(sink: Arc<dyn EnvelopeSink>) -> Self {
        Self {
            id: ConnectionId::next(),
            outbound: Outbound::Direct(sink),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hand an envelope to the connection. Never blocks.
    pub fn send(&self, envelope: Envelope) -> Result<(), BusError> {
        match &self.outbound {
            Outbound::Channel(tx) => tx.send(envelope).map_err(|_| BusError::TransportClosed),
            Outbound::Direct(sink) => sink.push(envelope),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.outbound {
            Outbound::Channel(tx) => tx.is_closed(),
            Outbound::Direct(sink) => sink.is_closed(),
        }
    }
}

/// Where a subscriber's envelopes go.
#[derive(Debug, Clone)]
pub enum DeliveryTarget {
    /// In-process queue drained by a handler task.
    Queue(mpsc::UnboundedSender<Envelope>),
    /// Live connection.
    Connection(ConnectionSink),
}

impl DeliveryTarget {
    /// Hand the envelope to the target. Never blocks.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), BusError> {
        match self {
            Self::Queue(tx) => tx.send(envelope).map_err(|_| BusError::TransportClosed),
            Self::Connection(sink) => sink.send(envelope),
        }
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Queue(_) => None,
            Self::Connection(sink) => Some(sink.id()),
        }
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Queue(tx) => tx.is_closed(),
            Self::Connection(sink) => sink.is_closed(),
        }
    }

    /// Whether both targets reach the same receiver.
    pub fn same_target(&self, other: &DeliveryTarget) -> bool {
        match (self, other) {
            (Self::Queue(a), Self::Queue(b)) => a.same_channel(b),
            (Self::Connection(a), Self::Connection(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

/// One registration on a topic.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub(crate) id: SubscriberId,
    pub(crate) topic: String,
    pub(crate) target: DeliveryTarget,
    pub(crate) name: Option<String>,
    pub(crate) active: Arc<AtomicBool>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn target(&self) -> &DeliveryTarget {
        &self.target
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Named delivery matches the bare name or `topic:name`.
    pub fn matches_name(&self, key: &str) -> bool {
        match &self.name {
            Some(name) => {
                name == key
                    || key
                        .strip_prefix(self.topic.as_str())
                        .and_then(|rest| rest.strip_prefix(':'))
                        == Some(name.as_str())
            }
            None => false,
        }
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber(topic: &str, name: Option<&str>) -> Subscriber {
        let (tx, _rx) = mpsc::unbounded_channel();
        Subscriber {
            id: SubscriberId(1),
            topic: topic.to_string(),
            target: DeliveryTarget::Queue(tx),
            name: name.map(str::to_string),
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn test_deliver_to_closed_queue() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let target = DeliveryTarget::Queue(tx);
        assert!(target.is_closed());
        assert_eq!(
            target.deliver(Envelope::new()),
            Err(BusError::TransportClosed)
        );
    }

    #[test]
    fn test_same_target() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sink = ConnectionSink::new(tx.clone());
        let a = DeliveryTarget::Connection(sink.clone());
        let b = DeliveryTarget::Connection(sink);
        let other = DeliveryTarget::Connection(ConnectionSink::new(tx.clone()));
        assert!(a.same_target(&b));
        assert!(!a.same_target(&other));
        assert!(DeliveryTarget::Queue(tx.clone()).same_target(&DeliveryTarget::Queue(tx)));
    }

    #[derive(Default)]
    struct Collect {
        seen: std::sync::Mutex<Vec<Envelope>>,
        closed: AtomicBool,
    }

    impl EnvelopeSink for Collect {
        fn push(&self, envelope: Envelope) -> Result<(), BusError> {
            if self.is_closed() {
                return Err(BusError::TransportClosed);
            }
            self.seen.lock().unwrap().push(envelope);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_direct_sink_receives_synchronously() {
        let collect = Arc::new(Collect::default());
        let sink = ConnectionSink::direct(collect.clone());

        sink.send(Envelope::new().with_topic("t")).unwrap();
        assert_eq!(collect.seen.lock().unwrap().len(), 1);

        collect.closed.store(true, Ordering::Release);
        assert!(sink.is_closed());
        assert_eq!(sink.send(Envelope::new()), Err(BusError::TransportClosed));
    }

    #[test]
    fn test_matches_name() {
        let sub = subscriber("orders", Some("audit"));
        assert!(sub.matches_name("audit"));
        assert!(sub.matches_name("orders:audit"));
        assert!(!sub.matches_name("billing:audit"));
        assert!(!subscriber("orders", None).matches_name("orders"));
    }
}
