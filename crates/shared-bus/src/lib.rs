//! # Shared Bus - In-Process Publish/Subscribe Registry
//!
//! The routing core every transport plugs into.
//!
//! ```text
//! ┌──────────────┐   publish()   ┌──────────────┐   deliver()   ┌──────────────┐
//! │  Producer    │ ────────────▶ │     Bus      │ ────────────▶ │ Queue task   │
//! └──────────────┘               │ topic → subs │               ├──────────────┤
//!                                │ id → target  │ ────────────▶ │ Conn writer  │
//!                                └──────────────┘               └──────────────┘
//! ```
//!
//! - **Subscribers** are in-process handlers (one task each) or live
//!   connections (one writer task each).
//! - **Identities** bind a name to exactly one delivery target for
//!   point-to-point delivery.
//! - **Pending replies** correlate a `*_wait_recv` call with its reply.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod bus;
pub mod pending;
pub mod subscriber;
pub mod subscription;

pub use bus::Bus;
pub use pending::{PendingReplies, PendingStats, DEFAULT_REPLY_TIMEOUT};
pub use subscriber::{
    ConnectionId, ConnectionSink, DeliveryTarget, EnvelopeSink, Subscriber, SubscriberId,
};
pub use subscription::Subscription;
