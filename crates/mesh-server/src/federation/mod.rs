//! Server-to-server federation.
//!
//! Each server keeps one outbound [`Client`] link per peer and a
//! [`PeerDirectory`] of what every peer advertised. Links are send-only: a
//! peer's traffic arrives through the link it dialed back to us.
//!
//! Forwarding is one hop. Envelopes forwarded to a peer are tagged with
//! `from_publisher`, and tagged envelopes are delivered locally but never
//! forwarded again.

pub mod directory;

pub use directory::{PeerDirectory, PeerEntry};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_client::{Client, ClientError};
use shared_types::{Action, BusError, Envelope};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Outbound connection to a peer. `token` tells apart successive links to
/// the same address.
#[derive(Debug, Clone)]
struct PeerLink {
    client: Client,
    token: u64,
}

#[derive(Debug)]
pub struct Federation {
    addr: String,
    directory: PeerDirectory,
    links: DashMap<String, PeerLink>,
    next_token: AtomicU64,
}

impl Federation {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            directory: PeerDirectory::new(),
            links: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Address this server advertises to peers.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn is_self(&self, addr: &str) -> bool {
        addr == self.addr
    }

    pub fn link(&self, addr: &str) -> Option<Client> {
        self.links.get(addr).map(|link| link.client.clone())
    }

    pub fn is_linked(&self, addr: &str) -> bool {
        self.links.contains_key(addr)
    }

    pub fn linked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.iter().map(|l| l.key().clone()).collect();
        peers.sort();
        peers
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Store a link unless one exists already; a losing link is closed.
    pub(crate) fn insert_link(&self, addr: &str, token: u64, client: Client) -> bool {
        match self.links.entry(addr.to_string()) {
            Entry::Occupied(_) => {
                client.close();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(PeerLink { client, token });
                true
            }
        }
    }

    /// Forget a peer: close its link and drop its directory entry.
    pub fn drop_link(&self, addr: &str) -> bool {
        self.directory.remove_peer(addr);
        match self.links.remove(addr) {
            Some((_, link)) => {
                link.client.close();
                debug!(peer = %addr, "Peer link dropped");
                true
            }
            None => false,
        }
    }

    /// Like [`Federation::drop_link`], only if the stored link is `token`.
    pub(crate) fn drop_link_if(&self, addr: &str, token: u64) -> bool {
        match self.links.remove_if(addr, |_, link| link.token == token) {
            Some((_, link)) => {
                self.directory.remove_peer(addr);
                link.client.close();
                debug!(peer = %addr, token, "Peer link lost");
                true
            }
            None => false,
        }
    }

    /// Forward a locally originated envelope to every peer claiming `topic`.
    ///
    /// Returns the number of peers it was sent to. Envelopes that already
    /// carry `from_publisher` are never forwarded.
    pub fn forward_publish(&self, topic: &str, envelope: &Envelope) -> usize {
        if envelope.from_publisher.is_some() {
            return 0;
        }
        let tagged = self.tag(envelope);
        let data = tagged.to_value();

        self.directory
            .peers_for_topic(topic)
            .into_iter()
            .filter(|peer| !self.is_self(peer))
            .filter_map(|peer| self.link(&peer).map(|link| (peer, link)))
            .filter(|(peer, link)| match link.publish(topic, data.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %peer, topic, error = %e, "Forward to peer failed");
                    false
                }
            })
            .count()
    }

    /// Forward a point-to-point envelope to the peers hosting `id`.
    pub fn forward_to_id(&self, id: &str, envelope: &Envelope) -> Result<(), BusError> {
        if envelope.from_publisher.is_some() {
            return Err(BusError::NotFound(id.to_string()));
        }
        let data = self.tag(envelope).to_value();

        let sent = self
            .directory
            .peers_for_id(id)
            .into_iter()
            .filter_map(|peer| self.link(&peer))
            .filter(|link| link.publish_to_id(id, data.clone()).is_ok())
            .count();

        if sent == 0 {
            return Err(BusError::NotFound(id.to_string()));
        }
        debug!(to_id = %id, peers = sent, "Envelope forwarded to peer identity");
        Ok(())
    }

    /// Send a control envelope over every link.
    pub fn broadcast(&self, envelope: &Envelope) {
        for link in self.links.iter() {
            if let Err(e) = link.client.send(envelope.clone()) {
                warn!(peer = %link.key(), error = %e, "Broadcast to peer failed");
            }
        }
    }

    /// Send a control envelope to one linked peer.
    pub fn send(&self, addr: &str, envelope: Envelope) -> Result<(), ClientError> {
        match self.link(addr) {
            Some(link) => link.send(envelope),
            None => Err(ClientError::Closed),
        }
    }

    /// `topics` advertisement of this server.
    pub fn topics_envelope(&self, topics: Vec<String>, ids: Vec<String>) -> Envelope {
        Envelope::action(Action::Topics)
            .with_addr(self.addr.clone())
            .with_topics(topics)
            .with_ids(ids)
    }

    fn tag(&self, envelope: &Envelope) -> Envelope {
        let mut tagged = envelope.clone();
        tagged.from_publisher = Some(self.addr.clone());
        tagged
    }
}
