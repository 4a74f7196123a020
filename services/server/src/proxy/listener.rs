//! Client-facing proxy listener.
//!
//! A client connects, sends one JSON line naming the endpoint and gets one
//! JSON line back. On `ok` the connection is relayed to the upstream,
//! locally or through the owning node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outpost_id::CorrelationId;
use outpost_mux::Stream;
use outpost_wire::{read_line, write_line, ProxyPreamble, ProxyReply, ProxyStatus};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::forwarder::Forwarder;
use super::inflight::InFlight;
use super::relay::proxy_bidirectional;
use super::router::{RouteDecision, Router};
use crate::config::ServerConfig;
use crate::ServerError;

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub max_connections: usize,
    /// A client must send its preamble within this window.
    pub preamble_timeout: Duration,
    /// Relay idle timeout. `None` keeps quiet connections open until
    /// shutdown.
    pub idle_timeout: Option<Duration>,
}

impl From<&ServerConfig> for ProxySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_connections: config.max_proxy_connections,
            preamble_timeout: config.handshake_timeout,
            idle_timeout: config.relay_idle_timeout,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProxyStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub routed_local: AtomicU64,
    pub routed_remote: AtomicU64,
    pub unresolved: AtomicU64,
    pub idle_closed: AtomicU64,
    pub cancelled: AtomicU64,
    pub gateway_failures: AtomicU64,
    pub bad_requests: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_from_upstream: AtomicU64,
}

pub struct ProxyListener {
    listener: TcpListener,
    router: Arc<Router>,
    forwarder: Arc<Forwarder>,
    inflight: Arc<InFlight>,
    settings: ProxySettings,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ProxyStats>,
}

impl ProxyListener {
    pub fn new(
        listener: TcpListener,
        router: Arc<Router>,
        forwarder: Arc<Forwarder>,
        inflight: Arc<InFlight>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            conn_semaphore: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            listener,
            router,
            forwarder,
            inflight,
            settings,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Accept client connections until shutdown. Connections already
    /// accepted run to completion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let bind_addr = self.listener.local_addr().ok();
        info!(bind_addr = ?bind_addr, "Proxy listener started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer_addr)) => {
                        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                                continue;
                            }
                        };
                        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let listener = Arc::clone(&self);
                        tokio::spawn(
                            async move {
                                if let Err(e) = listener.handle_connection(client).await {
                                    debug!(error = %e, reason = e.reason_code(), "Proxy connection error");
                                }
                                listener.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                drop(permit);
                            }
                            .instrument(tracing::info_span!("proxy", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Proxy accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy listener stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream) -> Result<(), ServerError> {
        let inflight = self.inflight.enter();

        let preamble: ProxyPreamble =
            match tokio::time::timeout(self.settings.preamble_timeout, read_line(&mut client)).await {
                Ok(Ok(preamble)) => preamble,
                Ok(Err(e)) => {
                    self.stats.bad_requests.fetch_add(1, Ordering::Relaxed);
                    let reply = ProxyReply::error(ProxyStatus::BadRequest, e.to_string());
                    let _ = write_line(&mut client, &reply).await;
                    return Err(e.into());
                }
                Err(_) => {
                    self.stats.bad_requests.fetch_add(1, Ordering::Relaxed);
                    let reply = ProxyReply::error(ProxyStatus::BadRequest, "preamble timed out");
                    let _ = write_line(&mut client, &reply).await;
                    return Err(ServerError::MalformedMessage("preamble timed out".to_string()));
                }
            };

        let endpoint_id = preamble.endpoint_id;
        let correlation_id = CorrelationId::new();
        let decision = self.router.route(&endpoint_id);
        debug!(
            endpoint_id = %endpoint_id,
            correlation_id = %correlation_id,
            route = decision.kind(),
            "Routing request"
        );

        let upstream: Result<Stream, ServerError> = match decision {
            RouteDecision::Local(conn) => {
                self.stats.routed_local.fetch_add(1, Ordering::Relaxed);
                conn.open_stream(&endpoint_id, correlation_id).await
            }
            RouteDecision::Remote { node, addr } => {
                self.stats.routed_remote.fetch_add(1, Ordering::Relaxed);
                debug!(owner = %node, %addr, "Forwarding to owner");
                self.forwarder.forward(&endpoint_id, correlation_id, addr).await
            }
            RouteDecision::Unresolved => Err(ServerError::RouteUnresolved(endpoint_id.clone())),
        };

        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                if e.is_gateway_failure() {
                    self.stats.gateway_failures.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.unresolved.fetch_add(1, Ordering::Relaxed);
                }
                info!(
                    endpoint_id = %endpoint_id,
                    correlation_id = %correlation_id,
                    reason = e.reason_code(),
                    "Request failed"
                );
                let reply = ProxyReply::error(e.proxy_status(), e.to_string());
                let _ = write_line(&mut client, &reply).await;
                return Ok(());
            }
        };

        write_line(&mut client, &ProxyReply::ok()).await?;

        let relay = proxy_bidirectional(client, upstream, self.settings.idle_timeout);
        let relayed = tokio::select! {
            relayed = relay => relayed,
            _ = inflight.cancelled() => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                info!(
                    endpoint_id = %endpoint_id,
                    correlation_id = %correlation_id,
                    "Relay closed by shutdown"
                );
                return Ok(());
            }
        };
        if relayed.idle {
            self.stats.idle_closed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .bytes_to_upstream
            .fetch_add(relayed.a_to_b, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(relayed.b_to_a, Ordering::Relaxed);
        debug!(
            endpoint_id = %endpoint_id,
            correlation_id = %correlation_id,
            bytes_to_upstream = relayed.a_to_b,
            bytes_from_upstream = relayed.b_to_a,
            "Request complete"
        );
        Ok(())
    }
}
