//! Gossip datagrams and the deltas they piggyback.

use std::net::SocketAddr;

use outpost_id::{EndpointId, NodeId};
use serde::{Deserialize, Serialize};

/// Membership status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Local node that has not finished its join sequence.
    Joining,
    Alive,
    Suspect,
    Dead,
    /// Terminal: the node announced a graceful departure.
    Left,
}

impl NodeStatus {
    /// Dead and left nodes own nothing and are never probed.
    pub fn is_gone(self) -> bool {
        matches!(self, NodeStatus::Dead | NodeStatus::Left)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Joining => "joining",
            NodeStatus::Alive => "alive",
            NodeStatus::Suspect => "suspect",
            NodeStatus::Dead => "dead",
            NodeStatus::Left => "left",
        };
        f.write_str(s)
    }
}

/// Sender identification carried by every gossip and sync message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: NodeId,
    /// Cluster address: UDP gossip and TCP peer link share this port.
    pub addr: SocketAddr,
    pub incarnation: u64,
}

/// A rumor about one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDelta {
    pub node: NodeId,
    pub addr: SocketAddr,
    pub incarnation: u64,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOp {
    Claim,
    Release,
}

/// A change to one endpoint's ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDelta {
    pub endpoint_id: EndpointId,
    pub owner: NodeId,
    pub incarnation: u64,
    pub op: ClaimOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipBody {
    Ping {
        seq: u64,
    },
    Ack {
        seq: u64,
    },
    /// Ask the receiver to probe `target` and relay the ack back.
    PingReq {
        seq: u64,
        target: NodeId,
        target_addr: SocketAddr,
    },
    /// Tells the receiver it is considered suspect or dead at `incarnation`.
    DeadNotice {
        incarnation: u64,
    },
    /// Graceful departure of the sender.
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub from: NodeMeta,
    pub body: GossipBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeDelta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointDelta>,
}

impl GossipMessage {
    pub fn new(from: NodeMeta, body: GossipBody) -> Self {
        Self {
            from,
            body,
            nodes: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

/// Full state exchanged during join and anti-entropy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub from: NodeMeta,
    pub nodes: Vec<NodeDelta>,
    pub endpoints: Vec<EndpointDelta>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_datagram, encode_datagram};

    fn meta() -> NodeMeta {
        NodeMeta {
            id: NodeId::new(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            incarnation: 3,
        }
    }

    #[test]
    fn test_ping_datagram_shape() {
        let msg = GossipMessage::new(meta(), GossipBody::Ping { seq: 9 });
        let value: serde_json::Value =
            serde_json::from_slice(&encode_datagram(&msg).unwrap()).unwrap();
        assert_eq!(value["body"]["type"], "ping");
        assert_eq!(value["body"]["seq"], 9);
        assert!(value.get("nodes").is_none());
    }

    #[test]
    fn test_piggyback_survives_datagram() {
        let from = meta();
        let mut msg = GossipMessage::new(from, GossipBody::Ack { seq: 1 });
        msg.endpoints.push(EndpointDelta {
            endpoint_id: EndpointId::parse("svc-a").unwrap(),
            owner: from.id,
            incarnation: 4,
            op: ClaimOp::Claim,
        });
        msg.nodes.push(NodeDelta {
            node: from.id,
            addr: from.addr,
            incarnation: 3,
            status: NodeStatus::Suspect,
        });

        let decoded: GossipMessage = decode_datagram(&encode_datagram(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_gone_statuses() {
        assert!(NodeStatus::Dead.is_gone());
        assert!(NodeStatus::Left.is_gone());
        assert!(!NodeStatus::Suspect.is_gone());
    }
}
