//! UDP gossip driver: failure detection and rumor dissemination.
//!
//! Every probe interval one peer is pinged. Without a direct ack within the
//! probe timeout, a few other peers are asked to ping it on our behalf; with
//! no ack from anyone by the end of the interval the target becomes suspect.
//! Every datagram piggybacks pending deltas from the recipient's outbox.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use outpost_id::NodeId;
use outpost_wire::{
    decode_datagram, encode_datagram, GossipBody, GossipMessage, NodeDelta, NodeStatus,
    WireError, MAX_DATAGRAM_LEN,
};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::membership::{Member, Membership, SenderVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Acked,
    /// First failed probe of a live node.
    Suspected,
    /// Failed again while already suspect.
    Unanswered,
}

pub struct Gossiper {
    socket: UdpSocket,
    membership: Arc<Membership>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_seq: AtomicU64,
}

impl Gossiper {
    pub fn new(socket: UdpSocket, membership: Arc<Membership>) -> Self {
        Self {
            socket,
            membership,
            waiters: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive and handle datagrams until shutdown.
    pub async fn run_receiver(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => match decode_datagram::<GossipMessage>(&buf[..len]) {
                            Ok(msg) => self.handle(msg, src).await,
                            Err(e) => debug!(%src, error = %e, "Dropping undecodable gossip datagram"),
                        },
                        Err(e) => debug!(error = %e, "Gossip receive failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Gossip receiver shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(self: &Arc<Self>, msg: GossipMessage, src: SocketAddr) {
        let membership = &self.membership;
        let from = msg.from;
        if from.id == membership.local_id() {
            return;
        }

        match membership.observe_sender(from) {
            SenderVerdict::Ignore => return,
            SenderVerdict::NotifyRefute { incarnation } => {
                self.send_to(from.id, from.addr, GossipBody::DeadNotice { incarnation })
                    .await;
            }
            SenderVerdict::Ok => {}
        }

        for delta in msg.nodes {
            membership.apply_node_delta(delta, Some(from.id));
        }
        for delta in msg.endpoints {
            membership.apply_endpoint_delta(delta, Some(from.id));
        }

        match msg.body {
            GossipBody::Ping { seq } => {
                self.send_to(from.id, src, GossipBody::Ack { seq }).await;
            }
            GossipBody::Ack { seq } => {
                membership.record_ack(&from.id);
                self.resolve(seq);
            }
            GossipBody::PingReq {
                seq,
                target,
                target_addr,
            } => {
                let gossiper = Arc::clone(self);
                tokio::spawn(async move {
                    gossiper.relay_probe(from.id, src, seq, target, target_addr).await;
                });
            }
            GossipBody::DeadNotice { incarnation } => {
                membership.refute(incarnation);
            }
            GossipBody::Leave => {
                membership.apply_node_delta(
                    NodeDelta {
                        node: from.id,
                        addr: from.addr,
                        incarnation: from.incarnation,
                        status: NodeStatus::Left,
                    },
                    None,
                );
            }
        }

        membership.reassert_if_needed();
    }

    /// Probe `target` for `requester` and relay the ack under its sequence.
    async fn relay_probe(
        &self,
        requester: NodeId,
        requester_addr: SocketAddr,
        seq: u64,
        target: NodeId,
        target_addr: SocketAddr,
    ) {
        let (own_seq, mut rx) = self.register_waiter();
        self.send_to(target, target_addr, GossipBody::Ping { seq: own_seq })
            .await;
        let timeout = self.membership.config().probe_timeout;
        let acked = matches!(tokio::time::timeout(timeout, &mut rx).await, Ok(Ok(())));
        self.forget_waiter(own_seq);

        if acked {
            self.send_to(requester, requester_addr, GossipBody::Ack { seq })
                .await;
        } else {
            debug!(node_id = %target, "Indirect probe got no ack");
        }
    }

    /// Run probe rounds and membership timers until shutdown.
    pub async fn run_prober(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let config = self.membership.config().clone();
        info!(
            interval_ms = config.probe_interval.as_millis() as u64,
            "Starting failure detector"
        );

        let mut interval = tokio::time::interval(config.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_round().await;
                    let report = self.membership.tick();
                    if !report.declared_dead.is_empty() || !report.reaped.is_empty() {
                        debug!(
                            dead = report.declared_dead.len(),
                            reaped = report.reaped.len(),
                            tombstones_reaped = report.tombstones_reaped,
                            "Membership timers fired"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Failure detector shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe the next target. An unanswered probe suspects it; the
    /// transition is logged by the membership once per node.
    async fn probe_round(&self) -> Option<ProbeOutcome> {
        let target = self.membership.next_probe_target()?;
        if self.probe(&target).await {
            return Some(ProbeOutcome::Acked);
        }
        if self.membership.suspect(&target.id) {
            Some(ProbeOutcome::Suspected)
        } else {
            Some(ProbeOutcome::Unanswered)
        }
    }

    /// One probe of `target`: direct ping, then indirect through helpers.
    /// Returns true if anyone acked within the probe interval.
    async fn probe(&self, target: &Member) -> bool {
        let config = self.membership.config();
        let started = Instant::now();

        // Direct and relayed acks share the sequence number, so a late
        // direct ack still counts during the indirect phase.
        let (seq, mut rx) = self.register_waiter();
        self.send_to(target.id, target.addr, GossipBody::Ping { seq })
            .await;
        if matches!(
            tokio::time::timeout(config.probe_timeout, &mut rx).await,
            Ok(Ok(()))
        ) {
            self.forget_waiter(seq);
            return true;
        }

        let helpers = self
            .membership
            .indirect_candidates(&target.id, config.indirect_probes);
        debug!(
            node_id = %target.id,
            helpers = helpers.len(),
            "Direct probe timed out, probing indirectly"
        );
        for helper in &helpers {
            self.send_to(
                helper.id,
                helper.addr,
                GossipBody::PingReq {
                    seq,
                    target: target.id,
                    target_addr: target.addr,
                },
            )
            .await;
        }

        let remaining = config.probe_interval.saturating_sub(started.elapsed());
        let acked = matches!(tokio::time::timeout(remaining, &mut rx).await, Ok(Ok(())));
        self.forget_waiter(seq);
        if acked {
            self.membership.record_ack(&target.id);
        }
        acked
    }

    /// Announce a graceful departure to every alive peer.
    pub async fn leave(&self) {
        let (delta, peers) = self.membership.leave();
        info!(
            incarnation = delta.incarnation,
            peers = peers.len(),
            "Announcing departure"
        );
        for peer in peers {
            let mut msg = self.membership.outgoing(&peer.id, GossipBody::Leave);
            msg.nodes.insert(0, delta);
            self.send(peer.addr, &msg).await;
        }
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<()>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(seq, tx);
        (seq, rx)
    }

    fn forget_waiter(&self, seq: u64) {
        self.lock_waiters().remove(&seq);
    }

    fn resolve(&self, seq: u64) {
        if let Some(tx) = self.lock_waiters().remove(&seq) {
            let _ = tx.send(());
        }
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn send_to(&self, peer: NodeId, addr: SocketAddr, body: GossipBody) {
        let msg = self.membership.outgoing(&peer, body);
        self.send(addr, &msg).await;
    }

    async fn send(&self, addr: SocketAddr, msg: &GossipMessage) {
        let buf = match encode_datagram(msg) {
            Ok(buf) => buf,
            Err(WireError::TooLarge { len, .. }) => {
                // Drop the piggyback rather than the message.
                warn!(len, "Gossip datagram too large, sending without piggyback");
                match encode_datagram(&GossipMessage::new(msg.from, msg.body.clone())) {
                    Ok(buf) => buf,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode gossip message");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode gossip message");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&buf, addr).await {
            debug!(%addr, error = %e, "Gossip send failed");
        }
    }
}
