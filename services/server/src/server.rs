//! Server runtime: wires the components together and owns their tasks.
//!
//! Lifecycle:
//!
//! 1. `start` binds the upstream, proxy and cluster (TCP + UDP) listeners,
//!    spawns every loop and joins the cluster through the seeds.
//! 2. `run` serves until the shutdown watch flips to `true`.
//! 3. `shutdown` stops accepting, drains in-flight requests for up to
//!    `shutdown_grace`, closes the relays still open, closes upstream
//!    sessions and leaves the cluster.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use outpost_id::{EndpointId, NodeId};
use outpost_wire::NodeStatus;
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::{EndpointTable, Gossiper, Membership, PeerLinks, StateSync};
use crate::config::ServerConfig;
use crate::peer::PeerService;
use crate::proxy::{Forwarder, InFlight, ProxyListener, ProxySettings, ProxyStats, Router};
use crate::registry::{Registry, RegistryEvent};
use crate::upstream::{ConnectionInfo, CredentialVerifier, UpstreamManager, UpstreamSettings};
use crate::ServerError;

/// How long cancelled relays get to unwind before shutdown moves on.
const RELAY_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Running components. Present between `start` and `shutdown`.
struct Runtime {
    upstream_addr: SocketAddr,
    proxy_addr: SocketAddr,
    cluster_addr: SocketAddr,
    table: Arc<EndpointTable>,
    registry: Arc<Registry>,
    membership: Arc<Membership>,
    gossiper: Arc<Gossiper>,
    links: Arc<PeerLinks>,
    upstreams: Arc<UpstreamManager>,
    forwarder: Arc<Forwarder>,
    router: Arc<Router>,
    inflight: Arc<InFlight>,
    proxy_stats: Arc<ProxyStats>,
    /// Stops the listeners.
    stop_tx: watch::Sender<bool>,
    /// Stops everything else: gossip, sync, accepted peer links.
    close_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub endpoint_id: EndpointId,
    pub owner: NodeId,
    pub incarnation: u64,
    pub last_heartbeat: DateTime<Utc>,
}

/// Point-in-time view of a running node.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub node_id: NodeId,
    pub cluster_addr: SocketAddr,
    pub status: NodeStatus,
    pub incarnation: u64,
    pub members: Vec<MemberStatus>,
    pub endpoints: Vec<EndpointStatus>,
    pub connections: Vec<ConnectionInfo>,
}

pub struct Server {
    config: ServerConfig,
    node_id: NodeId,
    verifier: Arc<dyn CredentialVerifier>,
    runtime: Option<Runtime>,
}

impl Server {
    pub fn new(config: ServerConfig, verifier: Arc<dyn CredentialVerifier>) -> Result<Self, ServerError> {
        config.validate()?;
        let node_id = config.node_id.unwrap_or_default();
        Ok(Self {
            config,
            node_id,
            verifier,
            runtime: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind listeners, spawn the component loops and join the cluster.
    ///
    /// A bind failure is the only fatal error. Calling `start` twice is a
    /// no-op.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.runtime.is_some() {
            return Ok(());
        }
        let config = &self.config;

        let upstream_listener = bind(config.upstream_addr).await?;
        let proxy_listener = bind(config.proxy_addr).await?;
        let cluster_listener = bind(config.cluster_addr).await?;
        let upstream_addr = upstream_listener.local_addr()?;
        let proxy_addr = proxy_listener.local_addr()?;
        let cluster_addr = cluster_listener.local_addr()?;
        // Gossip shares the port the TCP listener actually got.
        let udp = UdpSocket::bind(cluster_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: cluster_addr,
                source,
            })?;

        let advertise_addr = config.advertise_addr.unwrap_or(cluster_addr);
        if advertise_addr.ip().is_unspecified() {
            warn!(%advertise_addr, "Advertising an unspecified address; set advertise_addr");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (close_tx, close_rx) = watch::channel(false);

        let table = Arc::new(EndpointTable::new());
        let (registry, events) = Registry::new(Arc::clone(&table));
        let registry = Arc::new(registry);
        let membership = Arc::new(Membership::new(
            self.node_id,
            advertise_addr,
            config.cluster.clone(),
            Arc::clone(&table),
            Arc::clone(&registry),
        ));
        let gossiper = Arc::new(Gossiper::new(udp, Arc::clone(&membership)));
        let links = Arc::new(
            PeerLinks::new(config.forward_timeout)
                .with_keepalive(config.cluster.link_keepalive, config.cluster.link_keepalive_timeout),
        );
        let sync = Arc::new(StateSync::new(Arc::clone(&membership), Arc::clone(&links)));
        let upstreams = Arc::new(UpstreamManager::new(
            Arc::clone(&registry),
            Arc::clone(&self.verifier),
            UpstreamSettings::from(config),
        ));
        let inflight = InFlight::new();
        let forwarder = Arc::new(Forwarder::new(
            self.node_id,
            Arc::clone(&links),
            Arc::clone(&upstreams),
            Arc::clone(&inflight),
            config.forward_timeout,
            config.relay_idle_timeout,
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&table),
            Arc::clone(&registry),
            Arc::clone(&membership),
        ));
        let proxy = Arc::new(ProxyListener::new(
            proxy_listener,
            Arc::clone(&router),
            Arc::clone(&forwarder),
            Arc::clone(&inflight),
            ProxySettings::from(config),
        ));
        let proxy_stats = proxy.stats();
        let peer_service = Arc::new(
            PeerService::new(Arc::clone(&membership), Arc::clone(&forwarder))
                .with_keepalive(config.cluster.link_keepalive, config.cluster.link_keepalive_timeout),
        );

        let mut tasks = vec![
            tokio::spawn(publish_registry_events(
                events,
                self.node_id,
                Arc::clone(&membership),
            )),
            tokio::spawn(Arc::clone(&links).run_eviction(membership.departures())),
            tokio::spawn(Arc::clone(&gossiper).run_receiver(close_rx.clone())),
            tokio::spawn(Arc::clone(&gossiper).run_prober(close_rx.clone())),
            tokio::spawn(Arc::clone(&sync).run_anti_entropy(close_rx.clone())),
            tokio::spawn(Arc::clone(&peer_service).accept_loop(
                cluster_listener,
                stop_rx.clone(),
                close_rx.clone(),
            )),
            tokio::spawn(Arc::clone(&upstreams).accept_loop(upstream_listener, stop_rx.clone())),
            tokio::spawn(proxy.run(stop_rx)),
        ];

        info!(
            node_id = %self.node_id,
            %upstream_addr,
            %proxy_addr,
            %cluster_addr,
            %advertise_addr,
            seeds = config.seeds.len(),
            "Server started"
        );

        if !config.seeds.is_empty() {
            let joined = sync.join(&config.seeds).await;
            if joined == 0 {
                warn!("No seed reachable, starting alone and retrying in background");
                tasks.push(tokio::spawn(
                    Arc::clone(&sync).run_join_retry(config.seeds.clone(), close_rx),
                ));
            }
        }
        membership.mark_joined();

        self.runtime = Some(Runtime {
            upstream_addr,
            proxy_addr,
            cluster_addr: advertise_addr,
            table,
            registry,
            membership,
            gossiper,
            links,
            upstreams,
            forwarder,
            router,
            inflight,
            proxy_stats,
            stop_tx,
            close_tx,
            tasks,
        });
        Ok(())
    }

    /// Start if needed, serve until `shutdown` flips to `true`, then shut
    /// down gracefully.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        self.start().await?;
        // A dropped sender counts as a shutdown request.
        let _ = shutdown.wait_for(|stop| *stop).await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting, let in-flight requests finish within the grace
    /// period, close upstream sessions and leave the cluster. Idempotent.
    pub async fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        info!(node_id = %self.node_id, "Shutting down");

        let _ = runtime.stop_tx.send(true);
        runtime.upstreams.drain().await;
        runtime.forwarder.stop_serving();

        let remaining = runtime.inflight.wait_idle(self.config.shutdown_grace).await;
        if remaining > 0 {
            warn!(remaining, "Grace period expired, closing open relays");
        }
        runtime.inflight.cancel_all();
        let remaining = runtime.inflight.wait_idle(RELAY_CLOSE_WAIT).await;
        if remaining > 0 {
            warn!(remaining, "Requests still running after cancel");
        }

        runtime.upstreams.close_all().await;
        runtime.gossiper.leave().await;
        let _ = runtime.close_tx.send(true);
        runtime.links.close_all().await;
        for task in &runtime.tasks {
            task.abort();
        }
        info!(node_id = %self.node_id, "Shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn upstream_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|r| r.upstream_addr)
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|r| r.proxy_addr)
    }

    /// Advertised cluster address.
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.runtime.as_ref().map(|r| r.cluster_addr)
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.router))
    }

    pub fn membership(&self) -> Option<Arc<Membership>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.membership))
    }

    pub fn table(&self) -> Option<Arc<EndpointTable>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.table))
    }

    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.registry))
    }

    pub fn proxy_stats(&self) -> Option<Arc<ProxyStats>> {
        self.runtime.as_ref().map(|r| Arc::clone(&r.proxy_stats))
    }

    pub async fn status(&self) -> Option<ServerStatus> {
        let runtime = self.runtime.as_ref()?;
        let membership = &runtime.membership;
        let mut members: Vec<MemberStatus> = membership
            .members()
            .into_iter()
            .map(|m| MemberStatus {
                id: m.id,
                addr: m.addr,
                status: m.status,
                incarnation: m.incarnation,
            })
            .collect();
        members.sort_by_key(|m| m.id);

        let snapshot = runtime.table.snapshot();
        let mut endpoints: Vec<EndpointStatus> = snapshot
            .endpoints()
            .map(|e| EndpointStatus {
                endpoint_id: e.id.clone(),
                owner: e.owner,
                incarnation: e.incarnation,
                last_heartbeat: e.last_heartbeat,
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));

        Some(ServerStatus {
            node_id: self.node_id,
            cluster_addr: runtime.cluster_addr,
            status: membership.status(),
            incarnation: membership.incarnation(),
            members,
            endpoints,
            connections: runtime.upstreams.connections().await,
        })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.stop_tx.send(true);
            let _ = runtime.close_tx.send(true);
            for task in &runtime.tasks {
                task.abort();
            }
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Turn local registry changes into cluster-wide claims and releases, in
/// the order they happened.
async fn publish_registry_events(
    mut events: mpsc::UnboundedReceiver<RegistryEvent>,
    local_id: NodeId,
    membership: Arc<Membership>,
) {
    while let Some(event) = events.recv().await {
        let delta = event.to_delta(local_id);
        let outcome = membership.publish_local(delta);
        if !outcome.is_applied() {
            info!(?event, ?outcome, "Local claim superseded");
        }
    }
}
