//! # hub-app - Sessions, Log Ingestion and Node Plumbing
//!
//! Everything above single devices: configuration, the UDP log ingestion
//! service, the session coordinator, and both ends of the node link.
//!
//! ## Public API
//!
//! - [`config`] - hub.toml loading, validation and defaults
//! - [`LogIngestionService`] - receives log datagrams from apps under test
//! - [`SessionCoordinator`] - device selection, app sessions, log routing
//! - [`NodeService`] - node side: answers `RPCNode.*` calls
//! - [`NodeAgent`] - node side: dials the controller and keeps registered
//! - [`NodeListener`] - controller side: accepts nodes, mounts their managers
//! - [`run_master`] / [`run_node`] - process entry points

pub mod config;
pub mod hub;
pub mod node_agent;
pub mod node_listener;
pub mod node_service;
pub mod remlog;
pub mod session;

pub use config::Settings;
pub use hub::{local_managers, run_master, run_node};
pub use node_agent::NodeAgent;
pub use node_listener::{AttachedNode, NodeListener};
pub use node_service::{NodeService, ServeEnd};
pub use remlog::{LogIngestionHandle, LogIngestionService, LogLine};
pub use session::{SessionCoordinator, SessionHandle, SessionRequest};
