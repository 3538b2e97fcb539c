//! # meshbus node
//!
//! Runs one bus server as a process:
//!
//! 1. Load configuration (file + environment)
//! 2. Bind the listener
//! 3. Serve WebSocket, JSON-RPC and health endpoints
//! 4. Join configured peers (retried in the background)
//! 5. Stop on Ctrl+C

pub mod config;
pub mod runtime;

pub use config::load_config;
pub use runtime::NodeRuntime;
