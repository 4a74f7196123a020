//! Upstream registration handshake.
//!
//! The upstream speaks first. Both messages are length-prefixed JSON; once
//! the server accepts, the same transport carries multiplexed frames. Every
//! stream the server then opens starts with a [`StreamOpen`] header.

use outpost_id::{ConnectionId, CorrelationId, EndpointId};
use serde::{Deserialize, Serialize};

/// First message on a fresh upstream connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Opaque credential checked by the server's verifier.
    pub credential: String,

    /// Endpoints this connection will serve, in the order given.
    pub endpoints: Vec<EndpointId>,

    /// Free-form agent identification, logged by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// Server verdict on a [`RegisterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RegisterResponse {
    pub fn accept(connection_id: ConnectionId) -> Self {
        Self {
            accepted: true,
            connection_id: Some(connection_id),
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            connection_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// First message on every stream the server opens toward an upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub endpoint_id: EndpointId,
    pub correlation_id: CorrelationId,
}
