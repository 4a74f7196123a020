//! Membership state machine.
//!
//! Holds every known node, this node's own incarnation and the per-peer
//! outboxes, and applies the SWIM precedence rules to rumors. No I/O lives
//! here: the gossip driver feeds it messages and timer ticks and sends
//! whatever it hands back.
//!
//! Precedence, for a node known at incarnation `k`:
//! - `alive(i)` wins when `i > k` (or the node is unknown)
//! - `suspect(i)` applies to an alive node when `i >= k`
//! - `dead(i)` / `left(i)` apply when `i >= k`
//!
//! A rumor that this node is suspect or dead is refuted by bumping the local
//! incarnation past it and re-claiming every local endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use outpost_id::NodeId;
use outpost_wire::{
    ClaimOp, EndpointDelta, GossipBody, GossipMessage, NodeDelta, NodeMeta, NodeStatus,
    StateSnapshot,
};
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::outbox::Outboxes;
use super::table::{ApplyOutcome, EndpointTable};
use crate::config::ClusterConfig;
use crate::registry::Registry;

/// What this node knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,
    /// Last direct message from the node.
    pub last_seen: Instant,
    pub status_changed: Instant,
}

impl Member {
    fn delta(&self) -> NodeDelta {
        NodeDelta {
            node: self.id,
            addr: self.addr,
            incarnation: self.incarnation,
            status: self.status,
        }
    }

    fn is_probeable(&self) -> bool {
        matches!(self.status, NodeStatus::Alive | NodeStatus::Suspect)
    }
}

/// How to treat the sender of a direct message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderVerdict {
    Ok,
    /// We had it as suspect or dead; tell it so it refutes.
    NotifyRefute { incarnation: u64 },
    /// Message from a node that left; ignore it.
    Ignore,
}

/// A peer that was declared dead or announced it left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub node: NodeId,
    pub addr: SocketAddr,
}

/// A forgotten node, remembered long enough to reject its late rumors.
#[derive(Debug, Clone, Copy)]
struct Reaped {
    incarnation: u64,
    at: Instant,
}

/// Transitions produced by a timer tick.
#[derive(Debug, Default)]
pub struct TickReport {
    pub declared_dead: Vec<NodeId>,
    pub reaped: Vec<NodeId>,
    pub tombstones_reaped: usize,
}

struct State {
    incarnation: u64,
    status: NodeStatus,
    members: HashMap<NodeId, Member>,
    reaped: HashMap<NodeId, Reaped>,
    outboxes: Outboxes,
    probe_order: Vec<NodeId>,
    probe_cursor: usize,
    /// Local claims need re-minting after a refutation.
    needs_reassert: bool,
}

pub struct Membership {
    local_id: NodeId,
    local_addr: SocketAddr,
    config: ClusterConfig,
    table: Arc<EndpointTable>,
    registry: Arc<Registry>,
    departures: broadcast::Sender<Departure>,
    state: Mutex<State>,
}

impl Membership {
    pub fn new(
        local_id: NodeId,
        local_addr: SocketAddr,
        config: ClusterConfig,
        table: Arc<EndpointTable>,
        registry: Arc<Registry>,
    ) -> Self {
        let outboxes = Outboxes::new(config.max_piggyback, config.retransmits);
        let (departures, _) = broadcast::channel(256);
        Self {
            local_id,
            local_addr,
            config,
            table,
            registry,
            departures,
            state: Mutex::new(State {
                incarnation: 1,
                status: NodeStatus::Joining,
                members: HashMap::new(),
                reaped: HashMap::new(),
                outboxes,
                probe_order: Vec::new(),
                probe_cursor: 0,
                needs_reassert: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<EndpointTable> {
        &self.table
    }

    pub fn local_meta(&self) -> NodeMeta {
        NodeMeta {
            id: self.local_id,
            addr: self.local_addr,
            incarnation: self.lock().incarnation,
        }
    }

    pub fn incarnation(&self) -> u64 {
        self.lock().incarnation
    }

    pub fn status(&self) -> NodeStatus {
        self.lock().status
    }

    /// Joining → alive once the join sequence finished (or gave up).
    pub fn mark_joined(&self) {
        let mut state = self.lock();
        if state.status == NodeStatus::Joining {
            state.status = NodeStatus::Alive;
        }
    }

    /// Peers declared dead or left from now on.
    pub fn departures(&self) -> broadcast::Receiver<Departure> {
        self.departures.subscribe()
    }

    pub fn member(&self, id: &NodeId) -> Option<Member> {
        self.lock().members.get(id).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        self.lock().members.values().cloned().collect()
    }

    /// Peers currently believed alive.
    pub fn alive_peers(&self) -> Vec<Member> {
        self.lock()
            .members
            .values()
            .filter(|m| m.status == NodeStatus::Alive)
            .cloned()
            .collect()
    }

    pub fn is_alive(&self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return !self.lock().status.is_gone();
        }
        self.lock()
            .members
            .get(id)
            .is_some_and(|m| m.status == NodeStatus::Alive)
    }

    // -------------------------------------------------------------------------
    // Probing
    // -------------------------------------------------------------------------

    /// Next probe target from a shuffled round-robin of alive and suspect
    /// peers. The order is reshuffled after each full pass.
    pub fn next_probe_target(&self) -> Option<Member> {
        let mut state = self.lock();
        for _ in 0..2 {
            while state.probe_cursor < state.probe_order.len() {
                let id = state.probe_order[state.probe_cursor];
                state.probe_cursor += 1;
                if let Some(member) = state.members.get(&id).filter(|m| m.is_probeable()) {
                    return Some(member.clone());
                }
            }
            let mut order: Vec<NodeId> = state
                .members
                .values()
                .filter(|m| m.is_probeable())
                .map(|m| m.id)
                .collect();
            if order.is_empty() {
                return None;
            }
            order.shuffle(&mut rand::rng());
            state.probe_order = order;
            state.probe_cursor = 0;
        }
        None
    }

    /// Up to `k` random alive peers other than `target`, for indirect probes.
    pub fn indirect_candidates(&self, target: &NodeId, k: usize) -> Vec<Member> {
        let mut peers: Vec<Member> = self
            .alive_peers()
            .into_iter()
            .filter(|m| m.id != *target)
            .collect();
        peers.shuffle(&mut rand::rng());
        peers.truncate(k);
        peers
    }

    pub fn random_alive_peer(&self) -> Option<Member> {
        let mut peers = self.alive_peers();
        peers.shuffle(&mut rand::rng());
        peers.into_iter().next()
    }

    /// No ack by the end of the probe interval: suspect the target.
    pub fn suspect(&self, id: &NodeId) -> bool {
        let mut state = self.lock();
        let Some(member) = state.members.get_mut(id) else {
            return false;
        };
        if member.status != NodeStatus::Alive {
            return false;
        }
        member.status = NodeStatus::Suspect;
        member.status_changed = Instant::now();
        let delta = member.delta();
        warn!(node_id = %id, incarnation = delta.incarnation, "Node suspected");
        state.outboxes.broadcast_node(delta, None);
        true
    }

    pub fn record_ack(&self, id: &NodeId) {
        if let Some(member) = self.lock().members.get_mut(id) {
            member.last_seen = Instant::now();
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Account for a direct message from `meta`.
    pub fn observe_sender(&self, meta: NodeMeta) -> SenderVerdict {
        if meta.id == self.local_id {
            return SenderVerdict::Ignore;
        }

        let mut state = self.lock();
        let now = Instant::now();
        if state.reaped.remove(&meta.id).is_some() {
            debug!(node_id = %meta.id, "Reaped node is back");
        }
        let Some(member) = state.members.get_mut(&meta.id) else {
            let member = Member {
                id: meta.id,
                addr: meta.addr,
                status: NodeStatus::Alive,
                incarnation: meta.incarnation,
                last_seen: now,
                status_changed: now,
            };
            let delta = member.delta();
            state.members.insert(meta.id, member);
            state.outboxes.add_peer(meta.id);
            state.outboxes.broadcast_node(delta, Some(meta.id));
            info!(node_id = %meta.id, addr = %meta.addr, "Node discovered");
            return SenderVerdict::Ok;
        };

        member.last_seen = now;
        member.addr = meta.addr;

        let previous = member.status;
        let verdict = match previous {
            NodeStatus::Alive | NodeStatus::Joining => {
                if meta.incarnation > member.incarnation {
                    member.incarnation = meta.incarnation;
                    let delta = member.delta();
                    state.outboxes.broadcast_node(delta, Some(meta.id));
                }
                return SenderVerdict::Ok;
            }
            NodeStatus::Suspect | NodeStatus::Dead => {
                if meta.incarnation < member.incarnation {
                    // An old packet; the node has moved on already.
                    return SenderVerdict::Ok;
                }
                SenderVerdict::NotifyRefute {
                    incarnation: member.incarnation,
                }
            }
            NodeStatus::Left => {
                if meta.incarnation <= member.incarnation {
                    return SenderVerdict::Ignore;
                }
                SenderVerdict::Ok
            }
        };

        member.status = NodeStatus::Alive;
        member.incarnation = meta.incarnation;
        member.status_changed = now;
        let delta = member.delta();
        state.outboxes.add_peer(meta.id);
        state.outboxes.broadcast_node(delta, Some(meta.id));
        info!(
            node_id = %meta.id,
            previous = %previous,
            incarnation = meta.incarnation,
            "Node restored to alive by direct message"
        );
        verdict
    }

    /// Apply a rumor about a node. Returns true if it was news.
    pub fn apply_node_delta(&self, delta: NodeDelta, source: Option<NodeId>) -> bool {
        if delta.node == self.local_id {
            return self.rumor_about_self(delta);
        }

        let status = match delta.status {
            NodeStatus::Joining => NodeStatus::Alive,
            other => other,
        };

        let mut state = self.lock();
        let now = Instant::now();

        if let Some(reaped) = state.reaped.get(&delta.node) {
            // Only a fresh alive rumor brings a reaped node back.
            if status != NodeStatus::Alive || delta.incarnation <= reaped.incarnation {
                return false;
            }
            state.reaped.remove(&delta.node);
        }

        let became_gone = match state.members.get_mut(&delta.node) {
            None => {
                let member = Member {
                    id: delta.node,
                    addr: delta.addr,
                    status,
                    incarnation: delta.incarnation,
                    last_seen: now,
                    status_changed: now,
                };
                state.members.insert(delta.node, member);
                if !status.is_gone() {
                    state.outboxes.add_peer(delta.node);
                }
                debug!(node_id = %delta.node, status = %status, "Node learned from gossip");
                status.is_gone()
            }
            Some(member) => {
                let accept = match status {
                    NodeStatus::Alive | NodeStatus::Joining => {
                        delta.incarnation > member.incarnation
                    }
                    NodeStatus::Suspect => match member.status {
                        NodeStatus::Alive => delta.incarnation >= member.incarnation,
                        NodeStatus::Suspect => delta.incarnation > member.incarnation,
                        _ => false,
                    },
                    NodeStatus::Dead => match member.status {
                        NodeStatus::Left => false,
                        NodeStatus::Dead => delta.incarnation > member.incarnation,
                        _ => delta.incarnation >= member.incarnation,
                    },
                    NodeStatus::Left => {
                        member.status != NodeStatus::Left
                            && delta.incarnation >= member.incarnation
                    }
                };
                if !accept {
                    return false;
                }

                let was_gone = member.status.is_gone();
                if member.status != status {
                    member.status_changed = now;
                    info!(
                        node_id = %delta.node,
                        from = %member.status,
                        to = %status,
                        incarnation = delta.incarnation,
                        "Node status changed"
                    );
                }
                member.status = status;
                member.incarnation = delta.incarnation;
                member.addr = delta.addr;

                if was_gone && !status.is_gone() {
                    state.outboxes.add_peer(delta.node);
                }
                !was_gone && status.is_gone()
            }
        };

        let relayed = NodeDelta { status, ..delta };
        state.outboxes.broadcast_node(relayed, source);
        if became_gone {
            self.node_gone(&mut state, &delta.node);
        }
        true
    }

    fn rumor_about_self(&self, delta: NodeDelta) -> bool {
        let mut state = self.lock();
        if state.status == NodeStatus::Left {
            return false;
        }
        let contradicts = matches!(
            delta.status,
            NodeStatus::Suspect | NodeStatus::Dead | NodeStatus::Left
        );
        if !contradicts || delta.incarnation < state.incarnation {
            return false;
        }
        self.refute_locked(&mut state, delta.incarnation);
        true
    }

    /// Someone told us directly that we were declared dead or suspect.
    pub fn refute(&self, rumored_incarnation: u64) {
        let mut state = self.lock();
        if state.status == NodeStatus::Left || rumored_incarnation < state.incarnation {
            return;
        }
        self.refute_locked(&mut state, rumored_incarnation);
    }

    fn refute_locked(&self, state: &mut State, rumored: u64) {
        state.incarnation = rumored + 1;
        let delta = NodeDelta {
            node: self.local_id,
            addr: self.local_addr,
            incarnation: state.incarnation,
            status: NodeStatus::Alive,
        };
        state.outboxes.broadcast_node(delta, None);
        state.needs_reassert = true;
        warn!(
            incarnation = state.incarnation,
            "Refuting rumor of our failure"
        );
    }

    /// Re-mint local claims if a refutation asked for it. Returns how many
    /// endpoints were re-claimed. Called outside the state lock.
    pub fn reassert_if_needed(&self) -> usize {
        let needed = std::mem::take(&mut self.lock().needs_reassert);
        if needed {
            self.registry.reassert_all()
        } else {
            0
        }
    }

    /// Claims from a dead, left or recently reaped owner must not re-enter
    /// the table.
    fn owner_gone(&self, state: &State, delta: &EndpointDelta) -> bool {
        if delta.op != ClaimOp::Claim || delta.owner == self.local_id {
            return false;
        }
        state.reaped.contains_key(&delta.owner)
            || state
                .members
                .get(&delta.owner)
                .is_some_and(|m| m.status.is_gone())
    }

    /// Apply a claim or release learned from `source`.
    pub fn apply_endpoint_delta(&self, delta: EndpointDelta, source: Option<NodeId>) -> ApplyOutcome {
        if self.owner_gone(&self.lock(), &delta) {
            debug!(
                endpoint_id = %delta.endpoint_id,
                owner = %delta.owner,
                "Claim from departed owner discarded"
            );
            return ApplyOutcome::OwnerGone;
        }

        let outcome = self.table.apply_delta(&delta);
        if outcome.is_applied() {
            debug!(
                endpoint_id = %delta.endpoint_id,
                owner = %delta.owner,
                incarnation = delta.incarnation,
                op = ?delta.op,
                "Endpoint delta applied"
            );
            self.lock().outboxes.broadcast_endpoint(delta, source);
        }
        outcome
    }

    /// Apply a batch of deltas from `source` under one table swap. Returns
    /// how many were news.
    pub fn apply_endpoint_deltas(&self, deltas: Vec<EndpointDelta>, source: Option<NodeId>) -> usize {
        let deltas: Vec<EndpointDelta> = {
            let state = self.lock();
            deltas
                .into_iter()
                .filter(|d| !self.owner_gone(&state, d))
                .collect()
        };

        let outcomes = self.table.apply_batch(&deltas);
        let mut state = self.lock();
        let mut applied = 0;
        for (delta, outcome) in deltas.into_iter().zip(outcomes) {
            if outcome.is_applied() {
                state.outboxes.broadcast_endpoint(delta, source);
                applied += 1;
            }
        }
        applied
    }

    /// Apply and disseminate a claim or release made by this node.
    pub fn publish_local(&self, delta: EndpointDelta) -> ApplyOutcome {
        self.apply_endpoint_delta(delta, None)
    }

    /// Fold in a full state snapshot from a push-pull exchange.
    pub fn merge_snapshot(&self, snapshot: StateSnapshot) -> SenderVerdict {
        let from = snapshot.from.id;
        let verdict = self.observe_sender(snapshot.from);
        for delta in snapshot.nodes {
            self.apply_node_delta(delta, Some(from));
        }
        let applied = self.apply_endpoint_deltas(snapshot.endpoints, Some(from));
        if applied > 0 {
            debug!(node_id = %from, applied, "Snapshot endpoints merged");
        }
        verdict
    }

    /// Everything this node knows, for a push-pull exchange.
    pub fn state_snapshot(&self) -> StateSnapshot {
        let state = self.lock();
        let from = NodeMeta {
            id: self.local_id,
            addr: self.local_addr,
            incarnation: state.incarnation,
        };
        let mut nodes: Vec<NodeDelta> = state.members.values().map(Member::delta).collect();
        nodes.push(NodeDelta {
            node: self.local_id,
            addr: self.local_addr,
            incarnation: state.incarnation,
            status: match state.status {
                NodeStatus::Joining => NodeStatus::Alive,
                other => other,
            },
        });
        drop(state);

        StateSnapshot {
            from,
            nodes,
            endpoints: self.table.snapshot().to_deltas(),
        }
    }

    /// Build an outgoing gossip message to `peer`, piggybacking its outbox.
    pub fn outgoing(&self, peer: &NodeId, body: GossipBody) -> GossipMessage {
        let mut state = self.lock();
        let (nodes, endpoints) = state.outboxes.drain_for(peer);
        let from = NodeMeta {
            id: self.local_id,
            addr: self.local_addr,
            incarnation: state.incarnation,
        };
        GossipMessage {
            from,
            body,
            nodes,
            endpoints,
        }
    }

    // -------------------------------------------------------------------------
    // Timers and departure
    // -------------------------------------------------------------------------

    /// Promote expired suspects to dead and forget long-gone nodes.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let mut state = self.lock();

        let expired: Vec<NodeId> = state
            .members
            .values()
            .filter(|m| {
                m.status == NodeStatus::Suspect
                    && m.status_changed.elapsed() >= self.config.suspect_timeout
            })
            .map(|m| m.id)
            .collect();

        for id in expired {
            let Some(member) = state.members.get_mut(&id) else {
                continue;
            };
            member.status = NodeStatus::Dead;
            member.status_changed = Instant::now();
            let delta = member.delta();
            warn!(node_id = %id, incarnation = delta.incarnation, "Node declared dead");
            state.outboxes.broadcast_node(delta, None);
            self.node_gone(&mut state, &id);
            report.declared_dead.push(id);
        }

        let reap_after = self.config.reap_after;
        let reaped: Vec<NodeId> = state
            .members
            .values()
            .filter(|m| m.status.is_gone() && m.status_changed.elapsed() >= reap_after)
            .map(|m| m.id)
            .collect();
        // Outlives any retransmit or sync that could still carry their claims.
        state.reaped.retain(|_, r| r.at.elapsed() < reap_after);
        let now = Instant::now();
        for id in &reaped {
            if let Some(member) = state.members.remove(id) {
                state.reaped.insert(
                    *id,
                    Reaped {
                        incarnation: member.incarnation,
                        at: now,
                    },
                );
            }
            // Claims that arrived for it after it died.
            self.table.remove_owner(id);
            debug!(node_id = %id, "Node reaped");
        }
        report.reaped = reaped;
        drop(state);

        report.tombstones_reaped = self.table.reap_tombstones(reap_after);
        report
    }

    fn node_gone(&self, state: &mut State, id: &NodeId) {
        state.outboxes.remove_peer(id);
        if let Some(member) = state.members.get(id) {
            let _ = self.departures.send(Departure {
                node: *id,
                addr: member.addr,
            });
        }
        let removed = self.table.remove_owner(id);
        if !removed.is_empty() {
            info!(
                node_id = %id,
                endpoint_count = removed.len(),
                "Removed endpoints owned by departed node"
            );
        }
    }

    /// Mark this node as left. Returns the announcement and who to send it to.
    pub fn leave(&self) -> (NodeDelta, Vec<Member>) {
        let mut state = self.lock();
        state.incarnation += 1;
        state.status = NodeStatus::Left;
        let delta = NodeDelta {
            node: self.local_id,
            addr: self.local_addr,
            incarnation: state.incarnation,
            status: NodeStatus::Left,
        };
        let peers = state
            .members
            .values()
            .filter(|m| m.status == NodeStatus::Alive)
            .cloned()
            .collect();
        (delta, peers)
    }
}
