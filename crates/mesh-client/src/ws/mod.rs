//! WebSocket transport.

pub mod client;

pub use client::{Client, ClientSubscription, TopicHandler};
