//! # outpost-server
//!
//! Cluster-aware tunnel router. Upstream agents dial out to any node and
//! register named endpoints; clients connect to any node and are routed to
//! the upstream, locally or through the node that owns the endpoint.
//!
//! ## Modules
//!
//! - `upstream`: dial-in handshake, mux sessions, connection lifetimes
//! - `registry`: endpoints served by this node
//! - `cluster`: SWIM membership, gossip and the replicated endpoint table
//! - `proxy`: client listener, router, inter-node forwarder
//! - `peer`: inbound peer links (forwards and state syncs)
//! - `server`: runtime that wires it all together

pub mod cluster;
pub mod config;
mod error;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod upstream;

pub use config::{ClusterConfig, ServerConfig};
pub use error::ServerError;
pub use proxy::{RouteDecision, Router};
pub use registry::{Registry, RegistryEvent};
pub use server::{Server, ServerStatus};
pub use upstream::{AllowAll, CredentialVerifier, StaticTokens};
