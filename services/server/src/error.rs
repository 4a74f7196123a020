//! Server error taxonomy.

use std::io;
use std::net::SocketAddr;

use outpost_id::EndpointId;
use outpost_mux::MuxError;
use outpost_wire::{ProxyStatus, WireError};
use thiserror::Error;

/// Errors surfaced by the server core.
///
/// Only `Bind` is fatal, and only during `start`. Everything else is logged
/// and recovered by the component that hit it.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The upstream failed the registration handshake.
    #[error("handshake_rejected: {0}")]
    HandshakeRejected(String),

    /// An upstream session or peer link dropped.
    #[error("connection_lost: {0}")]
    ConnectionLost(String),

    /// No live owner for the endpoint.
    #[error("route_unresolved: {0}")]
    RouteUnresolved(EndpointId),

    /// The owning node did not answer before the forward deadline.
    #[error("forward_timeout: {0}")]
    ForwardTimeout(EndpointId),

    /// The owning node could not be reached or could not serve the request.
    #[error("forward_unreachable: {endpoint_id}: {detail}")]
    ForwardUnreachable {
        endpoint_id: EndpointId,
        detail: String,
    },

    /// A peer or client sent something we could not decode.
    #[error("malformed_message: {0}")]
    MalformedMessage(String),

    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid_config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Standardized reason code, used as a structured log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ServerError::HandshakeRejected(_) => "handshake_rejected",
            ServerError::ConnectionLost(_) => "connection_lost",
            ServerError::RouteUnresolved(_) => "route_unresolved",
            ServerError::ForwardTimeout(_) => "forward_timeout",
            ServerError::ForwardUnreachable { .. } => "forward_unreachable",
            ServerError::MalformedMessage(_) => "malformed_message",
            ServerError::Bind { .. } => "bind_failed",
            ServerError::Config(_) => "invalid_config",
            ServerError::Io(_) => "io_error",
        }
    }

    /// Status reported to a proxy client for this failure.
    pub fn proxy_status(&self) -> ProxyStatus {
        match self {
            ServerError::RouteUnresolved(_) => ProxyStatus::NotFound,
            ServerError::ForwardTimeout(_) => ProxyStatus::GatewayTimeout,
            ServerError::MalformedMessage(_) => ProxyStatus::BadRequest,
            _ => ProxyStatus::BadGateway,
        }
    }

    pub fn is_gateway_failure(&self) -> bool {
        matches!(
            self,
            ServerError::ForwardTimeout(_) | ServerError::ForwardUnreachable { .. }
        )
    }
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => ServerError::Io(e),
            WireError::UnexpectedEof => ServerError::ConnectionLost("peer closed".to_string()),
            other => ServerError::MalformedMessage(other.to_string()),
        }
    }
}

impl From<MuxError> for ServerError {
    fn from(err: MuxError) -> Self {
        ServerError::ConnectionLost(err.to_string())
    }
}
