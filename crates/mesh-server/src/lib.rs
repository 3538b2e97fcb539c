//! meshbus server: the routing hub of the bus.
//!
//! A [`Server`] owns a [`shared_bus::Bus`] and exposes it three ways:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  GET  /ws/bus   WebSocket action protocol   (ws)             │
//! │  POST /rpc      JSON-RPC polling bridge     (rpc)            │
//! │  GET  /health   liveness + counters                          │
//! │                                                              │
//! │  in-process     subscribe / publish / publish_to_id / waits  │
//! └──────────────┬───────────────────────────────┬───────────────┘
//!                │                               │
//!               Bus                         Federation
//!     (queues, connections, RPC)      (peer links + directory)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mesh_server::{Server, ServerConfig, ServerHooks};
//!
//! let (server, listener) = Server::bind(ServerConfig::default(), ServerHooks::default()).await?;
//! server.subscribe("greet", |env, _| println!("{env:?}"));
//! server.serve(listener).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod domain;
pub mod federation;
pub mod hooks;
pub mod rpc;
pub mod server;
pub mod ws;

pub use domain::{ApiError, ApiResult, ConfigError, PeerConfig, RpcConfig, ServerConfig, ServerError};
pub use federation::{Federation, PeerDirectory};
pub use hooks::ServerHooks;
pub use rpc::RpcBridge;
pub use server::{Server, WeakServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
