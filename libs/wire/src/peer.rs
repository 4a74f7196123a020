//! Inter-node link messages.
//!
//! Every stream a node opens on a peer link starts with one [`PeerRequest`]
//! and receives one [`PeerReply`]. Forward streams then carry raw bytes;
//! sync streams carry the snapshot pages in each direction.

use outpost_id::{CorrelationId, EndpointId, NodeId};
use serde::{Deserialize, Serialize};

use crate::SyncHeader;

/// A proxied request handed to the endpoint's owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    pub correlation_id: CorrelationId,
    pub endpoint_id: EndpointId,
    /// Node that received the client connection.
    pub origin: NodeId,
    /// Unix milliseconds after which the origin has given up.
    pub deadline_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Ok,
    /// The owner no longer has a local upstream for the endpoint.
    NotFound,
    /// The owner found the upstream but could not open a stream on it.
    UpstreamUnavailable,
    /// The deadline had already passed on arrival.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub correlation_id: CorrelationId,
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PeerRequest {
    Forward(ForwardEnvelope),
    /// Push half of a push-pull state exchange; pages follow.
    Sync(SyncHeader),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum PeerReply {
    Forward(ForwardResponse),
    Sync(SyncHeader),
}
