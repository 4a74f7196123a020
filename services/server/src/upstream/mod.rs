//! Upstream side: agents that dial in and register endpoints.
//!
//! ```text
//! agent ──TCP──► handshake ──► mux session ──► UpstreamConnection
//!                                                   │
//!                                       Registry (endpoint → connection)
//! ```

mod connection;
mod handshake;
mod manager;
mod verifier;

pub use connection::{ConnectionInfo, ConnectionState, UpstreamConnection};
pub use handshake::{accept_registration, Registration, MAX_ENDPOINTS_PER_CONNECTION};
pub use manager::{UpstreamManager, UpstreamSettings, UpstreamStats};
pub use verifier::{AllowAll, CredentialVerifier, StaticTokens};

#[cfg(test)]
pub(crate) use connection::echo_connection;
