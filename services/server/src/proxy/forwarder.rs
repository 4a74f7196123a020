//! Inter-node request forwarding.
//!
//! The node that received a client request opens a stream on its link to
//! the owner and sends a [`ForwardEnvelope`]. The owner answers with a
//! [`ForwardResponse`]; on `ok` the stream carries the request bytes to the
//! local upstream. The owner never forwards again, so a stale route fails
//! instead of bouncing between nodes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outpost_id::{CorrelationId, EndpointId, NodeId};
use outpost_mux::Stream;
use outpost_wire::{
    read_message, write_message, ForwardEnvelope, ForwardResponse, ForwardStatus, PeerReply,
    PeerRequest,
};
use tracing::{debug, warn};

use super::inflight::InFlight;
use super::relay::proxy_bidirectional;
use crate::cluster::PeerLinks;
use crate::upstream::UpstreamManager;
use crate::ServerError;

#[derive(Debug, Default)]
pub struct ForwarderStats {
    pub forwarded: AtomicU64,
    pub forward_failures: AtomicU64,
    pub served: AtomicU64,
    pub serve_failures: AtomicU64,
}

pub struct Forwarder {
    local_id: NodeId,
    links: Arc<PeerLinks>,
    upstreams: Arc<UpstreamManager>,
    inflight: Arc<InFlight>,
    forward_timeout: Duration,
    relay_idle_timeout: Option<Duration>,
    stopping: AtomicBool,
    stats: ForwarderStats,
}

impl Forwarder {
    pub fn new(
        local_id: NodeId,
        links: Arc<PeerLinks>,
        upstreams: Arc<UpstreamManager>,
        inflight: Arc<InFlight>,
        forward_timeout: Duration,
        relay_idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            local_id,
            links,
            upstreams,
            inflight,
            forward_timeout,
            relay_idle_timeout,
            stopping: AtomicBool::new(false),
            stats: ForwarderStats::default(),
        }
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.stats
    }

    /// Refuse forwards from peers from now on.
    pub fn stop_serving(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    /// Ask the node at `addr` to serve `endpoint_id`. On success the returned
    /// stream is connected to the owner's upstream.
    ///
    /// The deadline covers setup only; the relay after `ok` is bounded by
    /// the idle timeout on both nodes.
    pub async fn forward(
        &self,
        endpoint_id: &EndpointId,
        correlation_id: CorrelationId,
        addr: SocketAddr,
    ) -> Result<Stream, ServerError> {
        let envelope = ForwardEnvelope {
            correlation_id,
            endpoint_id: endpoint_id.clone(),
            origin: self.local_id,
            deadline_unix_ms: now_unix_ms() + self.forward_timeout.as_millis() as u64,
        };

        let result = match tokio::time::timeout(self.forward_timeout, self.setup(envelope, addr)).await
        {
            Ok(result) => result,
            Err(_) => Err(ServerError::ForwardTimeout(endpoint_id.clone())),
        };

        match &result {
            Ok(_) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                debug!(
                    endpoint_id = %endpoint_id,
                    correlation_id = %correlation_id,
                    %addr,
                    error = %e,
                    "Forward failed"
                );
            }
        }
        result
    }

    async fn setup(&self, envelope: ForwardEnvelope, addr: SocketAddr) -> Result<Stream, ServerError> {
        let endpoint_id = envelope.endpoint_id.clone();
        let unreachable = |detail: String| ServerError::ForwardUnreachable {
            endpoint_id: endpoint_id.clone(),
            detail,
        };

        let mut stream = self
            .links
            .open_stream(addr)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        write_message(&mut stream, &PeerRequest::Forward(envelope))
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let reply: PeerReply = read_message(&mut stream)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let response = match reply {
            PeerReply::Forward(response) => response,
            PeerReply::Sync(_) => {
                return Err(ServerError::MalformedMessage(
                    "sync reply to a forward request".to_string(),
                ))
            }
        };

        match response.status {
            ForwardStatus::Ok => Ok(stream),
            ForwardStatus::NotFound => Err(ServerError::RouteUnresolved(endpoint_id.clone())),
            ForwardStatus::Expired => Err(ServerError::ForwardTimeout(endpoint_id.clone())),
            ForwardStatus::UpstreamUnavailable => Err(unreachable(
                response
                    .message
                    .unwrap_or_else(|| "upstream unavailable".to_string()),
            )),
        }
    }

    /// Owner side: serve a forwarded request arriving on `stream`.
    pub async fn serve(&self, envelope: ForwardEnvelope, mut stream: Stream) {
        let inflight = self.inflight.enter();
        let correlation_id = envelope.correlation_id;
        let endpoint_id = envelope.endpoint_id;

        let reply = |status: ForwardStatus, message: Option<String>| ForwardResponse {
            correlation_id,
            status,
            message,
        };

        if now_unix_ms() > envelope.deadline_unix_ms {
            self.stats.serve_failures.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint_id = %endpoint_id, correlation_id = %correlation_id, "Forward arrived after deadline");
            let _ = write_message(&mut stream, &PeerReply::Forward(reply(ForwardStatus::Expired, None))).await;
            return;
        }

        if self.stopping.load(Ordering::Acquire) {
            let _ = write_message(
                &mut stream,
                &PeerReply::Forward(reply(
                    ForwardStatus::UpstreamUnavailable,
                    Some("node is shutting down".to_string()),
                )),
            )
            .await;
            return;
        }

        let upstream = match self
            .upstreams
            .open_upstream_stream(&endpoint_id, correlation_id)
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                self.stats.serve_failures.fetch_add(1, Ordering::Relaxed);
                let status = match e {
                    ServerError::RouteUnresolved(_) => ForwardStatus::NotFound,
                    _ => ForwardStatus::UpstreamUnavailable,
                };
                warn!(
                    endpoint_id = %endpoint_id,
                    correlation_id = %correlation_id,
                    origin = %envelope.origin,
                    error = %e,
                    "Cannot serve forwarded request"
                );
                let _ = write_message(&mut stream, &PeerReply::Forward(reply(status, Some(e.to_string()))))
                    .await;
                return;
            }
        };

        if let Err(e) =
            write_message(&mut stream, &PeerReply::Forward(reply(ForwardStatus::Ok, None))).await
        {
            debug!(correlation_id = %correlation_id, error = %e, "Origin went away before relay");
            return;
        }

        self.stats.served.fetch_add(1, Ordering::Relaxed);
        let relay = proxy_bidirectional(stream, upstream, self.relay_idle_timeout);
        tokio::select! {
            relayed = relay => debug!(
                endpoint_id = %endpoint_id,
                correlation_id = %correlation_id,
                bytes_in = relayed.a_to_b,
                bytes_out = relayed.b_to_a,
                idle = relayed.idle,
                "Forwarded request complete"
            ),
            _ = inflight.cancelled() => debug!(
                endpoint_id = %endpoint_id,
                correlation_id = %correlation_id,
                "Forwarded relay closed by shutdown"
            ),
        }
    }
}

pub(crate) fn now_unix_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
