//! outpost upstream agent
//!
//! Dials out to an outpost server, registers the endpoints it serves and
//! bridges every stream the server opens to the endpoint's local target.

mod agent;
mod config;
mod error;

pub use agent::{run, Agent};
pub use config::{AgentConfig, EndpointTarget};
pub use error::AgentError;
