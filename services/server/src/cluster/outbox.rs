//! Per-peer dissemination outboxes.
//!
//! Each peer has its own queue of deltas still owed to it. A newer delta for
//! the same key replaces the queued one. Draining takes the oldest entries
//! first and requeues each until it has been sent `retransmits` times.

use std::collections::{BTreeMap, HashMap};

use outpost_id::{EndpointId, NodeId};
use outpost_wire::{EndpointDelta, NodeDelta};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DeltaKey {
    Node(NodeId),
    Endpoint(EndpointId),
}

#[derive(Debug, Clone)]
enum Delta {
    Node(NodeDelta),
    Endpoint(EndpointDelta),
}

impl Delta {
    fn key(&self) -> DeltaKey {
        match self {
            Delta::Node(d) => DeltaKey::Node(d.node),
            Delta::Endpoint(d) => DeltaKey::Endpoint(d.endpoint_id.clone()),
        }
    }
}

#[derive(Debug)]
struct Pending {
    delta: Delta,
    sends_left: u32,
}

/// Deltas owed to a single peer.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: BTreeMap<u64, Pending>,
    index: HashMap<DeltaKey, u64>,
    next_seq: u64,
}

impl Outbox {
    fn push(&mut self, delta: Delta, sends: u32) {
        let key = delta.key();
        if let Some(old) = self.index.remove(&key) {
            self.queue.remove(&old);
        }
        self.enqueue(key, Pending {
            delta,
            sends_left: sends,
        });
    }

    fn enqueue(&mut self, key: DeltaKey, pending: Pending) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.queue.insert(seq, pending);
    }

    /// Take up to `max` deltas for one outgoing message.
    pub fn drain(&mut self, max: usize) -> (Vec<NodeDelta>, Vec<EndpointDelta>) {
        let mut nodes = Vec::new();
        let mut endpoints = Vec::new();
        let mut requeue = Vec::new();

        while nodes.len() + endpoints.len() < max {
            let Some((_, mut pending)) = self.queue.pop_first() else {
                break;
            };
            let key = pending.delta.key();
            self.index.remove(&key);

            match &pending.delta {
                Delta::Node(d) => nodes.push(*d),
                Delta::Endpoint(d) => endpoints.push(d.clone()),
            }

            pending.sends_left = pending.sends_left.saturating_sub(1);
            if pending.sends_left > 0 {
                requeue.push((key, pending));
            }
        }

        for (key, pending) in requeue {
            self.enqueue(key, pending);
        }
        (nodes, endpoints)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Outboxes for every known live peer.
#[derive(Debug)]
pub struct Outboxes {
    peers: HashMap<NodeId, Outbox>,
    max_piggyback: usize,
    retransmits: u32,
}

impl Outboxes {
    pub fn new(max_piggyback: usize, retransmits: u32) -> Self {
        Self {
            peers: HashMap::new(),
            max_piggyback: max_piggyback.max(1),
            retransmits: retransmits.max(1),
        }
    }

    pub fn add_peer(&mut self, peer: NodeId) {
        self.peers.entry(peer).or_default();
    }

    pub fn remove_peer(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    /// Queue a node rumor for every peer except `except` (usually its source).
    pub fn broadcast_node(&mut self, delta: NodeDelta, except: Option<NodeId>) {
        self.broadcast(Delta::Node(delta), except);
    }

    pub fn broadcast_endpoint(&mut self, delta: EndpointDelta, except: Option<NodeId>) {
        self.broadcast(Delta::Endpoint(delta), except);
    }

    fn broadcast(&mut self, delta: Delta, except: Option<NodeId>) {
        let sends = self.retransmits;
        for (peer, outbox) in self.peers.iter_mut() {
            if Some(*peer) != except {
                outbox.push(delta.clone(), sends);
            }
        }
    }

    /// Piggyback payload for the next message to `peer`.
    pub fn drain_for(&mut self, peer: &NodeId) -> (Vec<NodeDelta>, Vec<EndpointDelta>) {
        match self.peers.get_mut(peer) {
            Some(outbox) => outbox.drain(self.max_piggyback),
            None => (Vec::new(), Vec::new()),
        }
    }

    pub fn pending_for(&self, peer: &NodeId) -> usize {
        self.peers.get(peer).map(Outbox::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_wire::{ClaimOp, NodeStatus};

    fn node_delta(node: NodeId, incarnation: u64, status: NodeStatus) -> NodeDelta {
        NodeDelta {
            node,
            addr: "127.0.0.1:7946".parse().unwrap(),
            incarnation,
            status,
        }
    }

    fn endpoint_delta(name: &str, owner: NodeId) -> EndpointDelta {
        EndpointDelta {
            endpoint_id: EndpointId::parse(name).unwrap(),
            owner,
            incarnation: 1,
            op: ClaimOp::Claim,
        }
    }

    #[test]
    fn test_newest_delta_per_key_wins() {
        let mut outbox = Outbox::default();
        let n = NodeId::new();
        outbox.push(Delta::Node(node_delta(n, 1, NodeStatus::Alive)), 1);
        outbox.push(Delta::Node(node_delta(n, 1, NodeStatus::Suspect)), 1);
        assert_eq!(outbox.len(), 1);

        let (nodes, _) = outbox.drain(10);
        assert_eq!(nodes[0].status, NodeStatus::Suspect);
    }

    #[test]
    fn test_drain_is_bounded_and_retransmits() {
        let mut outboxes = Outboxes::new(2, 2);
        let peer = NodeId::new();
        outboxes.add_peer(peer);
        let owner = NodeId::new();
        for name in ["a", "b", "c"] {
            outboxes.broadcast_endpoint(endpoint_delta(name, owner), None);
        }

        let mut sent = Vec::new();
        loop {
            let (nodes, endpoints) = outboxes.drain_for(&peer);
            assert!(nodes.len() + endpoints.len() <= 2);
            if endpoints.is_empty() {
                break;
            }
            sent.extend(endpoints.into_iter().map(|d| d.endpoint_id.to_string()));
        }
        sent.sort();
        assert_eq!(sent, vec!["a", "a", "b", "b", "c", "c"]);
    }

    #[test]
    fn test_source_peer_is_skipped() {
        let mut outboxes = Outboxes::new(8, 1);
        let (source, other) = (NodeId::new(), NodeId::new());
        outboxes.add_peer(source);
        outboxes.add_peer(other);

        outboxes.broadcast_node(node_delta(NodeId::new(), 2, NodeStatus::Alive), Some(source));
        assert_eq!(outboxes.pending_for(&source), 0);
        assert_eq!(outboxes.pending_for(&other), 1);
    }

    #[test]
    fn test_removed_peer_gets_nothing() {
        let mut outboxes = Outboxes::new(8, 1);
        let peer = NodeId::new();
        outboxes.add_peer(peer);
        outboxes.remove_peer(&peer);
        outboxes.broadcast_node(node_delta(NodeId::new(), 1, NodeStatus::Alive), None);
        let (nodes, endpoints) = outboxes.drain_for(&peer);
        assert!(nodes.is_empty() && endpoints.is_empty());
    }
}
