//! Push-pull state exchange over peer links.
//!
//! Used to join through seed nodes and, periodically, as anti-entropy with
//! a random alive peer so rumors lost to UDP drops still converge. Both
//! directions travel as a header followed by snapshot pages, so the table
//! size is not bounded by one message.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use outpost_wire::{
    read_message, read_sync_pages, write_message, write_sync_pages, NodeDelta, NodeStatus,
    PeerReply, PeerRequest, StateSnapshot, SyncHeader,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::link::PeerLinks;
use super::membership::{Membership, SenderVerdict};
use crate::ServerError;

/// First delay of the background join retry.
const JOIN_RETRY_INITIAL: Duration = Duration::from_secs(1);

pub struct StateSync {
    membership: Arc<Membership>,
    links: Arc<PeerLinks>,
}

impl StateSync {
    pub fn new(membership: Arc<Membership>, links: Arc<PeerLinks>) -> Self {
        Self { membership, links }
    }

    /// Send our state to `addr` and merge what it sends back.
    pub async fn push_pull(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let mut stream = self.links.open_stream(addr).await?;
        let snapshot = self.membership.state_snapshot();
        write_message(&mut stream, &PeerRequest::Sync(snapshot.header())).await?;
        write_sync_pages(&mut stream, snapshot).await?;

        let header = match read_message::<_, PeerReply>(&mut stream).await? {
            PeerReply::Sync(header) => header,
            PeerReply::Forward(_) => {
                return Err(ServerError::MalformedMessage(
                    "forward reply to a sync request".to_string(),
                ))
            }
        };
        let snapshot = read_sync_pages(&mut stream, header).await?;
        let endpoints = snapshot.endpoints.len();
        self.membership.merge_snapshot(snapshot);
        self.membership.reassert_if_needed();
        debug!(%addr, node_id = %header.from.id, endpoints, "State exchange complete");
        Ok(())
    }

    /// Push-pull with every address the seeds resolve to, concurrently.
    /// Unreachable seeds are skipped. Returns how many exchanges succeeded.
    pub async fn join(self: &Arc<Self>, seeds: &[String]) -> usize {
        let timeout = self.membership.config().join_timeout;
        let addrs = self.resolve_seeds(seeds, timeout).await;
        if addrs.is_empty() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        for addr in addrs {
            let sync = Arc::clone(self);
            tasks.spawn(async move {
                let result = tokio::time::timeout(timeout, sync.push_pull(addr)).await;
                (addr, result)
            });
        }

        let mut joined = 0;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((_, Ok(Ok(())))) => joined += 1,
                Ok((addr, Ok(Err(e)))) => {
                    warn!(%addr, error = %e, reason = e.reason_code(), "Seed unreachable")
                }
                Ok((addr, Err(_))) => warn!(%addr, "Seed timed out"),
                Err(e) => warn!(error = %e, "Join task failed"),
            }
        }
        info!(joined, "Join finished");
        joined
    }

    async fn resolve_seeds(&self, seeds: &[String], timeout: Duration) -> Vec<SocketAddr> {
        let local = self.membership.local_addr();
        let mut seen = HashSet::new();
        let mut addrs = Vec::new();
        for seed in seeds {
            match tokio::time::timeout(timeout, tokio::net::lookup_host(seed.as_str())).await {
                Ok(Ok(resolved)) => {
                    for addr in resolved {
                        if addr != local && seen.insert(addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Ok(Err(e)) => warn!(seed = %seed, error = %e, "Seed did not resolve"),
                Err(_) => warn!(seed = %seed, "Seed resolution timed out"),
            }
        }
        addrs
    }

    /// Keep retrying the join with exponential backoff until one exchange
    /// succeeds or some peer found us first.
    pub async fn run_join_retry(self: Arc<Self>, seeds: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let max = self.membership.config().join_retry_max;
        let mut delay = JOIN_RETRY_INITIAL.min(max);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            if !self.membership.alive_peers().is_empty() {
                debug!("Peers discovered, stopping join retry");
                return;
            }
            if self.join(&seeds).await > 0 {
                return;
            }
            delay = (delay * 2).min(max);
            debug!(delay_ms = delay.as_millis() as u64, "Join retry scheduled");
        }
    }

    /// Periodic push-pull with one random alive peer.
    pub async fn run_anti_entropy(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.membership.config().sync_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(peer) = self.membership.random_alive_peer() else {
                        continue;
                    };
                    match tokio::time::timeout(period, self.push_pull(peer.addr)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(node_id = %peer.id, error = %e, "Anti-entropy exchange failed")
                        }
                        Err(_) => debug!(node_id = %peer.id, "Anti-entropy exchange timed out"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Anti-entropy loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Serve side of a push-pull opened by `header`: read the requester's
/// pages, merge them and answer with our own state.
pub async fn serve_sync<S>(
    membership: &Membership,
    header: SyncHeader,
    stream: &mut S,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_sync_pages(stream, header).await?;
    let reply = answer_sync(membership, request);
    write_message(stream, &PeerReply::Sync(reply.header())).await?;
    write_sync_pages(stream, reply).await?;
    Ok(())
}

/// Merge a requester's snapshot and build the answer.
///
/// If the requester was believed suspect or dead, the answer carries that
/// rumor so it refutes it.
fn answer_sync(membership: &Membership, request: StateSnapshot) -> StateSnapshot {
    let from = request.from;
    let verdict = membership.merge_snapshot(request);
    membership.reassert_if_needed();

    let mut reply = membership.state_snapshot();
    if let SenderVerdict::NotifyRefute { incarnation } = verdict {
        reply.nodes.push(NodeDelta {
            node: from.id,
            addr: from.addr,
            incarnation,
            status: NodeStatus::Dead,
        });
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::EndpointTable;
    use crate::config::ClusterConfig;
    use crate::registry::Registry;
    use outpost_id::{EndpointId, NodeId};
    use outpost_mux::{MuxConfig, Role, Session};
    use outpost_wire::{ClaimOp, EndpointDelta};
    use tokio::net::TcpListener;

    fn membership(addr: SocketAddr) -> Arc<Membership> {
        membership_with(addr, ClusterConfig::default())
    }

    fn membership_with(addr: SocketAddr, config: ClusterConfig) -> Arc<Membership> {
        let table = Arc::new(EndpointTable::new());
        let (registry, _events) = Registry::new(Arc::clone(&table));
        Arc::new(Membership::new(
            NodeId::new(),
            addr,
            config,
            table,
            Arc::new(registry),
        ))
    }

    /// A peer that answers sync requests and nothing else.
    async fn sync_peer() -> Arc<Membership> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = membership(listener.local_addr().unwrap());
        peer.mark_joined();
        let served = Arc::clone(&peer);
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let served = Arc::clone(&served);
                tokio::spawn(async move {
                    let session = Session::new(tcp, Role::Server, MuxConfig::default());
                    while let Some(mut stream) = session.accept().await {
                        let served = Arc::clone(&served);
                        tokio::spawn(async move {
                            if let Ok(PeerRequest::Sync(header)) = read_message(&mut stream).await {
                                if let Err(e) = serve_sync(&served, header, &mut stream).await {
                                    warn!(error = %e, "Test peer failed to answer sync");
                                    stream.reset();
                                }
                            }
                        });
                    }
                });
            }
        });
        peer
    }

    fn local() -> (Arc<StateSync>, Arc<Membership>) {
        local_with(ClusterConfig::default())
    }

    fn local_with(config: ClusterConfig) -> (Arc<StateSync>, Arc<Membership>) {
        let m = membership_with("127.0.0.1:1".parse().unwrap(), config);
        let links = Arc::new(PeerLinks::new(Duration::from_millis(500)));
        (Arc::new(StateSync::new(Arc::clone(&m), links)), m)
    }

    #[tokio::test]
    async fn test_push_pull_exchanges_both_ways() {
        let peer = sync_peer().await;
        peer.publish_local(EndpointDelta {
            endpoint_id: EndpointId::parse("remote-svc").unwrap(),
            owner: peer.local_id(),
            incarnation: 1,
            op: ClaimOp::Claim,
        });

        let (sync, me) = local();
        me.publish_local(EndpointDelta {
            endpoint_id: EndpointId::parse("local-svc").unwrap(),
            owner: me.local_id(),
            incarnation: 1,
            op: ClaimOp::Claim,
        });

        sync.push_pull(peer.local_addr()).await.unwrap();
        assert!(me.is_alive(&peer.local_id()));
        assert!(me.table().get(&EndpointId::parse("remote-svc").unwrap()).is_some());
        assert!(peer.table().get(&EndpointId::parse("local-svc").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_join_skips_unreachable_seed() {
        let peer = sync_peer().await;
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let (sync, me) = local();
        let seeds = vec![dead_addr.to_string(), peer.local_addr().to_string()];
        assert_eq!(sync.join(&seeds).await, 1);
        assert!(me.is_alive(&peer.local_id()));
    }

    #[tokio::test]
    async fn test_join_pulls_table_larger_than_one_message() {
        let peer = sync_peer().await;
        let owner = peer.local_id();
        let claims: Vec<EndpointDelta> = (0..12_000)
            .map(|i| EndpointDelta {
                endpoint_id: EndpointId::parse(&format!("tenant-{i:06}-service-name-padding-xx"))
                    .unwrap(),
                owner,
                incarnation: 1,
                op: ClaimOp::Claim,
            })
            .collect();
        assert_eq!(peer.apply_endpoint_deltas(claims, None), 12_000);

        let (sync, me) = local_with(ClusterConfig {
            join_timeout: Duration::from_secs(30),
            ..ClusterConfig::default()
        });
        me.publish_local(EndpointDelta {
            endpoint_id: EndpointId::parse("local-svc").unwrap(),
            owner: me.local_id(),
            incarnation: 1,
            op: ClaimOp::Claim,
        });

        assert_eq!(sync.join(&[peer.local_addr().to_string()]).await, 1);
        assert!(me.is_alive(&owner));
        assert_eq!(me.table().len(), 12_001);
        assert_eq!(peer.table().len(), 12_001);
        let last = EndpointId::parse("tenant-011999-service-name-padding-xx").unwrap();
        assert_eq!(me.table().get(&last).unwrap().owner, owner);
    }

    #[tokio::test]
    async fn test_join_with_no_seeds() {
        let (sync, _) = local();
        assert_eq!(sync.join(&[]).await, 0);
        assert_eq!(sync.join(&["not a host".to_string()]).await, 0);
    }

    #[test]
    fn test_answer_tells_dead_requester_to_refute() {
        let server = membership("127.0.0.1:2".parse().unwrap());
        let requester = membership("127.0.0.1:3".parse().unwrap());
        requester.mark_joined();
        server.apply_node_delta(
            NodeDelta {
                node: requester.local_id(),
                addr: requester.local_addr(),
                incarnation: 1,
                status: NodeStatus::Dead,
            },
            None,
        );

        let reply = answer_sync(&server, requester.state_snapshot());
        let before = requester.incarnation();
        requester.merge_snapshot(reply);
        assert!(requester.incarnation() > before);
    }
}
