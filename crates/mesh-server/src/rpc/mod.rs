//! RPC polling bridge.

pub mod bridge;
pub mod handler;
pub mod queue;

pub use bridge::RpcBridge;
pub use handler::handle_json_rpc;
pub use queue::RpcQueue;
