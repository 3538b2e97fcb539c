//! Peer directory: which topics and identities each peer server hosts.

use dashmap::DashMap;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerEntry {
    pub topics: BTreeSet<String>,
    pub ids: BTreeSet<String>,
}

/// Peer address to advertised entry.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: DashMap<String, PeerEntry>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about `addr`.
    pub fn replace<T, I>(&self, addr: &str, topics: T, ids: I)
    where
        T: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        let entry = PeerEntry {
            topics: topics.into_iter().collect(),
            ids: ids.into_iter().collect(),
        };
        debug!(peer = %addr, topics = entry.topics.len(), ids = entry.ids.len(), "Peer directory updated");
        self.entries.insert(addr.to_string(), entry);
    }

    /// Drop one topic from the peer's entry.
    pub fn remove_topic(&self, addr: &str, topic: &str) -> bool {
        self.entries
            .get_mut(addr)
            .map(|mut entry| entry.topics.remove(topic))
            .unwrap_or(false)
    }

    pub fn remove_peer(&self, addr: &str) -> bool {
        self.entries.remove(addr).is_some()
    }

    /// Peers claiming `topic`, sorted.
    pub fn peers_for_topic(&self, topic: &str) -> Vec<String> {
        self.collect(|entry| entry.topics.contains(topic))
    }

    /// Peers claiming identity `id`, sorted.
    pub fn peers_for_id(&self, id: &str) -> Vec<String> {
        self.collect(|entry| entry.ids.contains(id))
    }

    pub fn peers(&self) -> Vec<String> {
        self.collect(|_| true)
    }

    fn collect(&self, pred: impl Fn(&PeerEntry) -> bool) -> Vec<String> {
        let mut peers: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_replace_is_full_replace() {
        let dir = PeerDirectory::new();
        dir.replace("b:1", strings(&["news", "chat"]), strings(&["alice"]));
        dir.replace("b:1", strings(&["chat"]), Vec::new());

        assert!(dir.peers_for_topic("news").is_empty());
        assert_eq!(dir.peers_for_topic("chat"), vec!["b:1"]);
        assert!(dir.peers_for_id("alice").is_empty());
    }

    #[test]
    fn test_remove_topic() {
        let dir = PeerDirectory::new();
        dir.replace("b:1", strings(&["news"]), Vec::new());
        dir.replace("c:1", strings(&["news"]), strings(&["bob"]));

        assert!(dir.remove_topic("b:1", "news"));
        assert!(!dir.remove_topic("b:1", "news"));
        assert!(!dir.remove_topic("unknown:1", "news"));
        assert_eq!(dir.peers_for_topic("news"), vec!["c:1"]);
        assert_eq!(dir.peers_for_id("bob"), vec!["c:1"]);
    }

    #[test]
    fn test_remove_peer() {
        let dir = PeerDirectory::new();
        dir.replace("b:1", strings(&["news"]), Vec::new());
        assert!(dir.remove_peer("b:1"));
        assert!(dir.peers().is_empty());
        assert!(dir.peers_for_topic("news").is_empty());
    }
}
