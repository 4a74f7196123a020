//! One accepted upstream dial-in.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use outpost_id::{ConnectionId, CorrelationId, EndpointId};
use outpost_mux::{Session, Stream};
use outpost_wire::{write_message, StreamOpen};
use serde::Serialize;

use crate::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    /// Shutting down: no new streams are opened.
    Draining,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Active,
            1 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Active => 0,
            ConnectionState::Draining => 1,
            ConnectionState::Closed => 2,
        }
    }
}

/// Point-in-time view of a connection, for logs and status output.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub endpoints: Vec<EndpointId>,
    pub peer_addr: SocketAddr,
    pub agent: Option<String>,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub streams_opened: u64,
}

/// An upstream connection and the multiplexed session it carries.
///
/// Owned by the connection manager of the node that accepted it. The
/// registry and router hold `Arc`s only to open streams.
pub struct UpstreamConnection {
    id: ConnectionId,
    endpoints: Vec<EndpointId>,
    peer_addr: SocketAddr,
    agent: Option<String>,
    session: Session,
    created_at: DateTime<Utc>,
    state: AtomicU8,
}

impl UpstreamConnection {
    pub fn new(
        id: ConnectionId,
        endpoints: Vec<EndpointId>,
        peer_addr: SocketAddr,
        agent: Option<String>,
        session: Session,
    ) -> Self {
        Self {
            id,
            endpoints,
            peer_addr,
            agent,
            session,
            created_at: Utc::now(),
            state: AtomicU8::new(ConnectionState::Active.as_u8()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoints(&self) -> &[EndpointId] {
        &self.endpoints
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last time any frame arrived from the upstream.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.session.last_activity_unix_ms() as i64)
    }

    pub fn state(&self) -> ConnectionState {
        if self.session.is_closed() {
            return ConnectionState::Closed;
        }
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Open a stream to the upstream and announce which endpoint it is for.
    pub async fn open_stream(
        &self,
        endpoint_id: &EndpointId,
        correlation_id: CorrelationId,
    ) -> Result<Stream, ServerError> {
        if !self.is_active() {
            return Err(ServerError::ConnectionLost(format!(
                "upstream {} is {:?}",
                self.id,
                self.state()
            )));
        }

        let mut stream = self.session.open_stream()?;
        let header = StreamOpen {
            endpoint_id: endpoint_id.clone(),
            correlation_id,
        };
        write_message(&mut stream, &header).await?;
        Ok(stream)
    }

    /// Resolves once the session is gone for any reason.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    pub fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.session.close();
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            endpoints: self.endpoints.clone(),
            peer_addr: self.peer_addr,
            agent: self.agent.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            streams_opened: self.session.stats().streams_opened,
        }
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// In-memory upstream whose streams echo whatever they receive.
#[cfg(test)]
pub(crate) fn echo_connection(endpoints: &[&str]) -> std::sync::Arc<UpstreamConnection> {
    use outpost_mux::{MuxConfig, Role};
    use outpost_wire::read_message;

    let (server_io, agent_io) = tokio::io::duplex(256 * 1024);
    let session = Session::new(server_io, Role::Server, MuxConfig::default());
    let agent = Session::new(agent_io, Role::Client, MuxConfig::default());
    tokio::spawn(async move {
        while let Some(mut stream) = agent.accept().await {
            tokio::spawn(async move {
                if read_message::<_, StreamOpen>(&mut stream).await.is_ok() {
                    let (mut r, mut w) = tokio::io::split(stream);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = tokio::io::AsyncWriteExt::shutdown(&mut w).await;
                }
            });
        }
    });

    let endpoints = endpoints
        .iter()
        .map(|e| EndpointId::parse(e).unwrap())
        .collect();
    std::sync::Arc::new(UpstreamConnection::new(
        ConnectionId::new(),
        endpoints,
        "127.0.0.1:40000".parse().unwrap(),
        Some("test".to_string()),
        session,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stream_reaches_upstream() {
        let conn = echo_connection(&["svc-a"]);
        let endpoint = EndpointId::parse("svc-a").unwrap();
        let mut stream = conn.open_stream(&endpoint, CorrelationId::new()).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn test_draining_refuses_streams() {
        let conn = echo_connection(&["svc-a"]);
        conn.set_state(ConnectionState::Draining);
        let endpoint = EndpointId::parse("svc-a").unwrap();
        let err = conn
            .open_stream(&endpoint, CorrelationId::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason_code(), "connection_lost");
    }

    #[tokio::test]
    async fn test_close_marks_closed() {
        let conn = echo_connection(&["svc-a"]);
        assert!(conn.is_active());
        conn.close();
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.info().state, ConnectionState::Closed);
    }
}
