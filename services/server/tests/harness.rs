//! Test harness for multi-node integration tests.
//!
//! Spawns echo backends, servers on ephemeral loopback ports with fast
//! membership timers, agents and proxy clients.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use outpost_agent::{Agent, AgentConfig};
use outpost_id::{EndpointId, NodeId};
use outpost_server::{AllowAll, ClusterConfig, Server, ServerConfig};
use outpost_wire::{read_line, write_line, ProxyPreamble, ProxyReply, ProxyStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    #[allow(dead_code)]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Membership timers short enough for tests to observe failure detection.
pub fn fast_cluster() -> ClusterConfig {
    ClusterConfig {
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(40),
        indirect_probes: 2,
        suspect_timeout: Duration::from_millis(600),
        sync_interval: Duration::from_millis(500),
        reap_after: Duration::from_secs(3),
        join_timeout: Duration::from_millis(500),
        join_retry_max: Duration::from_secs(1),
        max_piggyback: 16,
        retransmits: 3,
        link_keepalive: Duration::from_millis(200),
        link_keepalive_timeout: Duration::from_secs(1),
    }
}

pub struct TestNode {
    pub server: Server,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn spawn(seeds: Vec<String>) -> Self {
        Self::spawn_with(seeds, |_| {}).await
    }

    /// Spawn with a fixed cluster address, for nodes others already seed from.
    pub async fn spawn_at(cluster_addr: SocketAddr, seeds: Vec<String>) -> Self {
        Self::spawn_with(seeds, |config| config.cluster_addr = cluster_addr).await
    }

    /// Spawn with `tweak` applied over the test defaults.
    pub async fn spawn_with(seeds: Vec<String>, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let mut config = ServerConfig::ephemeral()
            .with_seeds(seeds)
            .with_cluster(fast_cluster());
        config.forward_timeout = Duration::from_secs(2);
        config.shutdown_grace = Duration::from_millis(500);
        tweak(&mut config);
        let mut server = Server::new(config, Arc::new(AllowAll)).unwrap();
        server.start().await.unwrap();
        Self { server }
    }

    pub fn id(&self) -> NodeId {
        self.server.node_id()
    }

    /// This node's cluster address as a seed entry.
    pub fn seed(&self) -> String {
        self.server.cluster_addr().unwrap().to_string()
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.server.upstream_addr().unwrap()
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.server.proxy_addr().unwrap()
    }

    pub fn owner_of(&self, endpoint: &str) -> Option<NodeId> {
        let id = EndpointId::parse(endpoint).unwrap();
        self.server.table()?.get(&id).map(|e| e.owner)
    }

    pub fn sees_alive(&self, node: NodeId) -> bool {
        self.server
            .membership()
            .map(|m| m.is_alive(&node))
            .unwrap_or(false)
    }
}

/// A connected agent serving one endpoint. Dropping it closes the session.
pub struct TestAgent {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TestAgent {
    pub async fn connect(server: SocketAddr, endpoint: &str, target: SocketAddr) -> Self {
        let config = AgentConfig::new(server.to_string(), "token")
            .with_endpoint(format!("{endpoint}={target}").parse().unwrap());
        let agent = Agent::connect(Arc::new(config)).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = agent.serve(shutdown_rx).await;
        });
        Self { shutdown_tx, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// Send the preamble and return the reply with the connection.
pub async fn proxy_connect(proxy: SocketAddr, endpoint: &str) -> io::Result<(ProxyReply, TcpStream)> {
    let mut stream = TcpStream::connect(proxy).await?;
    let preamble = ProxyPreamble {
        endpoint_id: EndpointId::parse(endpoint).unwrap(),
    };
    write_line(&mut stream, &preamble).await.map_err(io::Error::other)?;
    let reply: ProxyReply = read_line(&mut stream).await.map_err(io::Error::other)?;
    Ok((reply, stream))
}

/// Push `payload` through the proxy and read the echo back.
pub async fn roundtrip(proxy: SocketAddr, endpoint: &str, payload: &[u8]) -> Result<Vec<u8>, ProxyStatus> {
    let attempt = async {
        let (reply, mut stream) = proxy_connect(proxy, endpoint)
            .await
            .map_err(|_| ProxyStatus::BadGateway)?;
        if !reply.is_ok() {
            return Err(reply.status);
        }
        stream.write_all(payload).await.map_err(|_| ProxyStatus::BadGateway)?;
        let mut buf = vec![0u8; payload.len()];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| ProxyStatus::BadGateway)?;
        Ok(buf)
    };
    tokio::time::timeout(Duration::from_secs(5), attempt)
        .await
        .unwrap_or(Err(ProxyStatus::GatewayTimeout))
}

/// Poll `check` every 20ms until it holds or `limit` elapses.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A loopback address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
