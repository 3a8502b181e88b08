//! # hub-node - Node Transport
//!
//! The RPC channel between the controller and a node process that
//! physically hosts devices. One long-lived WebSocket per node carries
//! request/response frames; many callers may have calls in flight at once.
//!
//! ## Public API
//!
//! - [`NodeClient`] - clonable calling side of a node connection
//! - [`ClientCodec`] - pending table and frame codec used by the client
//! - [`RequestFrame`], [`ResponseFrame`] - wire frames
//! - [`messages`] - `RPCNode.*` method names and payloads

pub mod client;
pub mod messages;
pub mod protocol;

pub use client::{next_text, NodeClient, TransportState, DEFAULT_CALL_TIMEOUT};
pub use protocol::{ClientCodec, Completion, RequestFrame, ResponseFrame, RpcResponse};
