//! Client-facing proxy preamble.
//!
//! A client opens a TCP connection to any node's proxy listener and sends a
//! single JSON line naming the endpoint. The node answers with one JSON line;
//! on `ok` the connection becomes a raw byte pipe to the upstream.

use outpost_id::EndpointId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPreamble {
    pub endpoint_id: EndpointId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Ok,
    /// No live owner for the endpoint.
    NotFound,
    /// The owning node could not be reached.
    BadGateway,
    /// The owning node did not answer before the deadline.
    GatewayTimeout,
    /// The preamble could not be parsed.
    BadRequest,
    /// The node is shutting down.
    Unavailable,
}

impl std::fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProxyStatus::Ok => "ok",
            ProxyStatus::NotFound => "not_found",
            ProxyStatus::BadGateway => "bad_gateway",
            ProxyStatus::GatewayTimeout => "gateway_timeout",
            ProxyStatus::BadRequest => "bad_request",
            ProxyStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub status: ProxyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProxyReply {
    pub fn ok() -> Self {
        Self {
            status: ProxyStatus::Ok,
            message: None,
        }
    }

    pub fn error(status: ProxyStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ProxyStatus::Ok
    }
}
