//! Upstream connection manager.
//!
//! Accepts upstream dial-ins, runs the registration handshake, wraps each
//! accepted transport in a mux session and keeps the registry in step with
//! connection lifetimes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outpost_id::{ConnectionId, CorrelationId, EndpointId};
use outpost_mux::{MuxConfig, Role, Session, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{ConnectionInfo, ConnectionState, UpstreamConnection};
use super::handshake::accept_registration;
use super::verifier::CredentialVerifier;
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::ServerError;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub handshake_timeout: Duration,
    pub max_connections: usize,
    pub keepalive: Option<Duration>,
    pub keepalive_timeout: Duration,
}

impl From<&ServerConfig> for UpstreamSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            max_connections: config.max_upstream_connections,
            keepalive: config.upstream_keepalive,
            keepalive_timeout: config.upstream_keepalive_timeout,
        }
    }
}

#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub handshakes_failed: AtomicU64,
    pub connections_active: AtomicU64,
    pub streams_opened: AtomicU64,
}

pub struct UpstreamManager {
    registry: Arc<Registry>,
    verifier: Arc<dyn CredentialVerifier>,
    settings: UpstreamSettings,
    connections: RwLock<HashMap<ConnectionId, Arc<UpstreamConnection>>>,
    conn_semaphore: Arc<Semaphore>,
    draining: AtomicBool,
    stats: UpstreamStats,
}

impl UpstreamManager {
    pub fn new(
        registry: Arc<Registry>,
        verifier: Arc<dyn CredentialVerifier>,
        settings: UpstreamSettings,
    ) -> Self {
        Self {
            registry,
            verifier,
            conn_semaphore: Arc::new(Semaphore::new(settings.max_connections.max(1))),
            settings,
            connections: RwLock::new(HashMap::new()),
            draining: AtomicBool::new(false),
            stats: UpstreamStats::default(),
        }
    }

    pub fn stats(&self) -> &UpstreamStats {
        &self.stats
    }

    /// Accept upstream dial-ins until shutdown.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let bind_addr = listener.local_addr().ok();
        info!(bind_addr = ?bind_addr, "Upstream listener started");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(peer_addr = %peer_addr, "Upstream rejected: max connections reached");
                                continue;
                            }
                        };
                        let _ = tcp.set_nodelay(true);
                        let manager = Arc::clone(&self);
                        tokio::spawn(
                            async move {
                                if let Err(e) = manager.handle_connection(tcp, peer_addr).await {
                                    debug!(error = %e, reason = e.reason_code(), "Upstream connection ended");
                                }
                                drop(permit);
                            }
                            .instrument(tracing::info_span!("upstream", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Upstream accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Upstream listener stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Serve one upstream transport for its whole lifetime.
    pub async fn handle_connection<S>(&self, mut io: S, peer_addr: SocketAddr) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.draining.load(Ordering::Acquire) {
            return Err(ServerError::ConnectionLost("server is draining".to_string()));
        }

        let registration =
            match accept_registration(&mut io, &*self.verifier, self.settings.handshake_timeout).await {
                Ok(registration) => registration,
                Err(e) => {
                    self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, reason = e.reason_code(), "Upstream handshake failed");
                    return Err(e);
                }
            };

        let mut mux = MuxConfig::default();
        if let Some(interval) = self.settings.keepalive {
            mux = mux.with_keepalive(interval, self.settings.keepalive_timeout);
        }
        let session = Session::new(io, Role::Server, mux);
        let conn = Arc::new(UpstreamConnection::new(
            registration.connection_id,
            registration.endpoints,
            peer_addr,
            registration.agent,
            session,
        ));

        self.connections
            .write()
            .await
            .insert(conn.id(), Arc::clone(&conn));
        self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        for endpoint_id in conn.endpoints() {
            self.registry.register_local(endpoint_id, Arc::clone(&conn));
        }

        conn.closed().await;
        info!(connection_id = %conn.id(), "Upstream disconnected");
        self.cleanup(&conn).await;
        Ok(())
    }

    async fn cleanup(&self, conn: &UpstreamConnection) {
        conn.set_state(ConnectionState::Closed);
        for endpoint_id in conn.endpoints() {
            self.registry.deregister_connection(endpoint_id, conn.id());
        }
        if self.connections.write().await.remove(&conn.id()).is_some() {
            self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Open a stream to the local upstream serving `endpoint_id`.
    ///
    /// `RouteUnresolved` when no local upstream holds the endpoint.
    pub async fn open_upstream_stream(
        &self,
        endpoint_id: &EndpointId,
        correlation_id: CorrelationId,
    ) -> Result<Stream, ServerError> {
        let conn = self
            .registry
            .lookup_local(endpoint_id)
            .ok_or_else(|| ServerError::RouteUnresolved(endpoint_id.clone()))?;
        let stream = conn.open_stream(endpoint_id, correlation_id).await?;
        self.stats.streams_opened.fetch_add(1, Ordering::Relaxed);
        Ok(stream)
    }

    /// Stop opening new streams on any upstream. Streams already open keep
    /// running.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        for conn in self.connections.read().await.values() {
            conn.set_state(ConnectionState::Draining);
        }
    }

    /// Close every upstream session and drop its registrations.
    pub async fn close_all(&self) {
        let conns: Vec<Arc<UpstreamConnection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in &conns {
            conn.close();
            self.cleanup(conn).await;
        }
        if !conns.is_empty() {
            info!(count = conns.len(), "Closed upstream connections");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.info())
            .collect()
    }
}
