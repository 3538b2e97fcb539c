//! Polling RPC transport.

pub mod client;

pub use client::{RpcClient, RpcHandler, RpcSubscription};
