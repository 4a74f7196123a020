//! Persistent multiplexed TCP links to peer nodes.
//!
//! One mux session per peer cluster address, dialed lazily and reused by
//! every forward and sync. A dead session is replaced on next use; keepalive
//! notices a half-open one, and membership evicts the link of a peer that
//! died or left.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outpost_mux::{MuxConfig, Role, Session, Stream};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::membership::Departure;
use crate::ServerError;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<Session>>>>;

pub struct PeerLinks {
    slots: Mutex<HashMap<SocketAddr, Slot>>,
    dial_timeout: Duration,
    mux: MuxConfig,
}

impl PeerLinks {
    pub fn new(dial_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dial_timeout,
            mux: MuxConfig::default(),
        }
    }

    fn slot(&self, addr: SocketAddr) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(slots.entry(addr).or_default())
    }

    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.mux = self.mux.with_keepalive(interval, timeout);
        self
    }

    /// Open a stream to the peer at `addr`, dialing if needed.
    pub async fn open_stream(&self, addr: SocketAddr) -> Result<Stream, ServerError> {
        let slot = self.slot(addr);
        // Concurrent callers for one peer wait for a single dial.
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref().filter(|s| !s.is_closed()) {
            match session.open_stream() {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!(%addr, error = %e, "Peer link unusable, redialing"),
            }
        }

        let session = Arc::new(self.dial(addr).await?);
        let stream = session.open_stream()?;
        *guard = Some(session);
        Ok(stream)
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Session, ServerError> {
        let tcp = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                return Err(ServerError::ConnectionLost(format!(
                    "dial {addr} failed: {e}"
                )))
            }
            Err(_) => {
                return Err(ServerError::ConnectionLost(format!(
                    "dial {addr} timed out"
                )))
            }
        };
        let _ = tcp.set_nodelay(true);
        info!(%addr, "Peer link established");
        Ok(Session::new(tcp, Role::Client, self.mux.clone()))
    }

    /// Number of peers with an open session.
    pub async fn connected(&self) -> usize {
        let slots: Vec<Slot> = {
            let slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.values().cloned().collect()
        };
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|s| !s.is_closed()) {
                count += 1;
            }
        }
        count
    }

    /// Drop the link to one peer, e.g. after it was declared dead.
    pub async fn disconnect(&self, addr: SocketAddr) {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.remove(&addr)
        };
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.take() {
                session.close();
                info!(%addr, "Peer link dropped");
            }
        }
    }

    /// Drop links to peers as membership reports them gone.
    pub async fn run_eviction(
        self: Arc<Self>,
        mut departures: broadcast::Receiver<Departure>,
    ) {
        loop {
            match departures.recv().await {
                Ok(departure) => {
                    debug!(node_id = %departure.node, addr = %departure.addr, "Evicting peer link");
                    self.disconnect(departure.addr).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed peer departures");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Some(session) = slot.lock().await.take() {
                session.close();
            }
        }
    }
}
