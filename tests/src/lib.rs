//! # meshbus Test Suite
//!
//! End-to-end scenarios across crates.
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs         # Server startup, polling helpers
//! └── integration/
//!     ├── ws_flows.rs     # WebSocket client ↔ server
//!     ├── rpc_flows.rs    # Polling RPC client ↔ server
//!     └── federation.rs   # Server ↔ server forwarding
//! ```
//!
//! ```bash
//! cargo test -p mesh-tests
//! cargo test -p mesh-tests integration::federation::
//! ```

pub mod fixtures;
pub mod integration;
