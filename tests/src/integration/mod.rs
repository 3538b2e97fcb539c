//! Cross-crate scenarios.

pub mod federation;
pub mod rpc_flows;
pub mod ws_flows;
