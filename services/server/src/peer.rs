//! Inbound side of peer links.
//!
//! Peers dial our cluster address and multiplex forwards and state syncs
//! over one session. Each stream carries exactly one [`PeerRequest`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use outpost_mux::{MuxConfig, Role, Session, Stream};
use outpost_wire::{read_message, PeerRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use crate::cluster::{serve_sync, Membership};
use crate::proxy::Forwarder;

/// A peer that opens a stream must send its request within this window.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PeerService {
    membership: Arc<Membership>,
    forwarder: Arc<Forwarder>,
    mux: MuxConfig,
}

impl PeerService {
    pub fn new(membership: Arc<Membership>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            membership,
            forwarder,
            mux: MuxConfig::default(),
        }
    }

    /// Close accepted links whose dialer went silent.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.mux = self.mux.with_keepalive(interval, timeout);
        self
    }

    /// Accept peer links until `shutdown`. Accepted links stay up until
    /// `closing` fires, so forwards in flight can finish.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
        closing: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let _ = tcp.set_nodelay(true);
                        let service = Arc::clone(&self);
                        let closing = closing.clone();
                        tokio::spawn(
                            service
                                .serve_link(tcp, peer_addr, closing)
                                .instrument(tracing::info_span!("peer_link", peer = %peer_addr)),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Peer accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Peer listener stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn serve_link(self: Arc<Self>, tcp: TcpStream, peer_addr: SocketAddr, mut closing: watch::Receiver<bool>) {
        let session = Session::new(tcp, Role::Server, self.mux.clone());
        debug!(%peer_addr, "Peer link accepted");
        loop {
            tokio::select! {
                accepted = session.accept() => match accepted {
                    Some(stream) => {
                        let service = Arc::clone(&self);
                        tokio::spawn(async move { service.handle_stream(stream).await });
                    }
                    None => break,
                },
                _ = closing.changed() => {
                    if *closing.borrow() {
                        break;
                    }
                }
            }
        }
        session.close();
        debug!(%peer_addr, "Peer link closed");
    }

    async fn handle_stream(&self, mut stream: Stream) {
        let request = match tokio::time::timeout(REQUEST_TIMEOUT, read_message::<_, PeerRequest>(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                debug!(stream_id = stream.id(), error = %e, "Bad peer request");
                stream.reset();
                return;
            }
            Err(_) => {
                debug!(stream_id = stream.id(), "Peer request timed out");
                stream.reset();
                return;
            }
        };

        match request {
            PeerRequest::Forward(envelope) => self.forwarder.serve(envelope, stream).await,
            PeerRequest::Sync(header) => {
                let exchange = serve_sync(&self.membership, header, &mut stream);
                match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(node_id = %header.from.id, error = %e, "Failed to answer sync");
                        stream.reset();
                    }
                    Err(_) => {
                        debug!(node_id = %header.from.id, "Sync exchange timed out");
                        stream.reset();
                    }
                }
            }
        }
    }
}
