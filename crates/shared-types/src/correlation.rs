//! Correlation ID for request/reply cycles.
//!
//! A correlation id doubles as the name of an ephemeral topic: the waiting
//! side subscribes to it, the replying side publishes to it.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation ID (random UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// The topic name replies are published to.
    pub fn topic(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_correlation_id() {
        let id1 = CorrelationId::new();
        let id2 = CorrelationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_topic_matches_display() {
        let id = CorrelationId::new();
        assert_eq!(id.topic(), id.to_string());
        assert_eq!(id.topic().len(), 36);
    }

    #[test]
    fn test_parse_correlation_id() {
        let id = CorrelationId::new();
        let parsed = CorrelationId::parse(&id.topic()).unwrap();
        assert_eq!(id, parsed);
        assert!(CorrelationId::parse("not-a-uuid").is_err());
    }
}
