//! # meshbus client
//!
//! Two ways for a process to join a bus server:
//!
//! - [`Client`]: a persistent WebSocket connection. The server pushes
//!   envelopes as they are published.
//! - [`RpcClient`]: plain JSON-RPC calls. The server queues envelopes per
//!   identity and the client polls them.
//!
//! Both announce an identity with `ping`, keep a local topic → handler table
//! that is replayed after reconnects, acknowledge envelopes carrying an
//! `event_id`, and offer `*_wait_recv` request/reply helpers.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod options;
pub mod retry;
pub mod rpc;
pub mod ws;

pub use error::ClientError;
pub use options::{ClientHooks, ClientOptions, RpcClientOptions, DEFAULT_RESTART_EVERY};
pub use retry::{retry_every, run_every};
pub use rpc::{RpcClient, RpcSubscription};
pub use ws::{Client, ClientSubscription};
