//! Control actions understood by the persistent-connection endpoint.

use std::fmt;

/// An inbound control action.
///
/// Several actions accept a legacy alias (`publish` for `pub`, camelCase
/// forms, `new_node` for `server_sub`); [`Action::parse`] folds them onto one
/// variant and [`Action::as_str`] returns the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Register the sender identity on the connection.
    Ping,
    /// Broadcast `data` to a topic.
    Publish,
    /// Deliver `data` to one identity.
    PublishToId,
    /// Register the connection on a topic.
    Subscribe,
    /// Remove the connection from a topic.
    Unsubscribe,
    /// Delete a topic and all of its subscribers.
    RemoveTopic,
    /// Deliver `data` to subscribers registered under a name.
    SendTo,
    /// Relay `data` to another server.
    PublishToServer,
    /// Opaque federation payload addressed to a server.
    ServerMessage,
    /// A peer server joins the mesh.
    ServerSub,
    /// Full-replace topic directory advertised by a peer.
    Topics,
    /// A peer withdraws interest in one topic.
    RemoveNodeTopic,
}

impl Action {
    /// Parse an action name, accepting the legacy aliases.
    pub fn parse(name: &str) -> Option<Self> {
        let action = match name {
            "ping" => Self::Ping,
            "pub" | "publish" => Self::Publish,
            "pub_id" => Self::PublishToId,
            "sub" | "subscribe" => Self::Subscribe,
            "unsub" | "unsubscribe" => Self::Unsubscribe,
            "remove_topic" | "removeTopic" => Self::RemoveTopic,
            "send" | "sendTo" => Self::SendTo,
            "pub_server" => Self::PublishToServer,
            "server_message" | "serverMessage" => Self::ServerMessage,
            "server_sub" | "new_node" => Self::ServerSub,
            "topics" => Self::Topics,
            "remove_node_topic" => Self::RemoveNodeTopic,
            _ => return None,
        };
        Some(action)
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Publish => "pub",
            Self::PublishToId => "pub_id",
            Self::Subscribe => "sub",
            Self::Unsubscribe => "unsub",
            Self::RemoveTopic => "remove_topic",
            Self::SendTo => "send",
            Self::PublishToServer => "pub_server",
            Self::ServerMessage => "server_message",
            Self::ServerSub => "server_sub",
            Self::Topics => "topics",
            Self::RemoveNodeTopic => "remove_node_topic",
        }
    }

    /// Whether this action belongs to the server-to-server protocol.
    pub fn is_federation(&self) -> bool {
        matches!(
            self,
            Self::PublishToServer
                | Self::ServerMessage
                | Self::ServerSub
                | Self::Topics
                | Self::RemoveNodeTopic
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
