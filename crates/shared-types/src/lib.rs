//! # Shared Types Crate
//!
//! The vocabulary every bus participant speaks: the [`Envelope`] exchanged on
//! the wire and in-process, the control [`Action`]s a persistent connection
//! understands, [`CorrelationId`]s for request/reply cycles and the
//! [`BusError`] taxonomy.
//!
//! ## Design Principles
//!
//! - **Structured envelope**: routing metadata lives in typed optional fields;
//!   everything else travels in a flattened payload map, so the JSON form stays
//!   a single flat object.
//! - **Mutable per hop**: each hop stamps its routing metadata (`topic`,
//!   `to_id`, `from_publisher`) in place.

pub mod action;
pub mod correlation;
pub mod envelope;
pub mod errors;
pub mod rpc;

pub use action::Action;
pub use correlation::CorrelationId;
pub use envelope::Envelope;
pub use errors::*;
pub use rpc::{RpcRequest, RpcResponse};

/// Default upgrade path of the persistent-connection endpoint.
pub const DEFAULT_WS_PATH: &str = "/ws/bus";
