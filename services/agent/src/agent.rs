//! Dial-out session to a server and the stream bridge behind it.

use std::sync::Arc;
use std::time::Duration;

use outpost_id::ConnectionId;
use outpost_mux::{MuxConfig, Role, Session, Stream};
use outpost_wire::{read_message, write_message, RegisterRequest, RegisterResponse, StreamOpen};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::{AgentConfig, AgentError};

/// First delay of the reconnect backoff.
const RECONNECT_INITIAL: Duration = Duration::from_millis(250);

/// A registered connection to a server.
pub struct Agent {
    config: Arc<AgentConfig>,
    session: Session,
    connection_id: ConnectionId,
}

impl Agent {
    /// Dial the server and register every configured endpoint.
    pub async fn connect(config: Arc<AgentConfig>) -> Result<Self, AgentError> {
        config.validate()?;
        let addr = config.server_addr.clone();
        let tcp = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => return Err(AgentError::Connect { addr, source }),
            Err(_) => return Err(AgentError::Timeout("connect")),
        };
        let _ = tcp.set_nodelay(true);
        Self::handshake(tcp, config).await
    }

    /// Register over an established transport.
    pub async fn handshake<S>(mut io: S, config: Arc<AgentConfig>) -> Result<Self, AgentError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = RegisterRequest {
            credential: config.credential.clone(),
            endpoints: config.endpoints.iter().map(|e| e.endpoint_id.clone()).collect(),
            agent: config.name.clone(),
        };

        let exchange = async {
            write_message(&mut io, &request).await?;
            read_message::<_, RegisterResponse>(&mut io).await
        };
        let response = match tokio::time::timeout(config.handshake_timeout, exchange).await {
            Ok(response) => response?,
            Err(_) => return Err(AgentError::Timeout("handshake")),
        };

        let connection_id = match (response.accepted, response.connection_id) {
            (true, Some(id)) => id,
            (true, None) => {
                return Err(AgentError::SessionLost(
                    "accepted without a connection id".to_string(),
                ))
            }
            (false, _) => {
                return Err(AgentError::Rejected(
                    response.reason.unwrap_or_else(|| "no reason given".to_string()),
                ))
            }
        };

        let mut mux = MuxConfig::default();
        if let Some(interval) = config.keepalive {
            mux = mux.with_keepalive(interval, config.keepalive_timeout);
        }
        let session = Session::new(io, Role::Client, mux);
        info!(
            connection_id = %connection_id,
            endpoints = config.endpoints.len(),
            "Registered with server"
        );

        Ok(Self {
            config,
            session,
            connection_id,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn close(&self) {
        self.session.close();
    }

    /// Bridge server-opened streams to local targets until the session ends
    /// or `shutdown` flips. Returns `Ok` only on shutdown.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        loop {
            tokio::select! {
                accepted = self.session.accept() => match accepted {
                    Some(stream) => {
                        let config = Arc::clone(&self.config);
                        let span = tracing::info_span!("stream", stream_id = stream.id());
                        tokio::spawn(bridge(stream, config).instrument(span));
                    }
                    None => {
                        return Err(AgentError::SessionLost(format!(
                            "connection {} closed",
                            self.connection_id
                        )));
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.session.close();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Read the stream header, dial the endpoint's target and relay.
async fn bridge(mut stream: Stream, config: Arc<AgentConfig>) {
    let header: StreamOpen =
        match tokio::time::timeout(config.handshake_timeout, read_message(&mut stream)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                debug!(error = %e, "Bad stream header");
                stream.reset();
                return;
            }
            Err(_) => {
                debug!("Stream header timed out");
                stream.reset();
                return;
            }
        };

    let Some(target) = config.target_for(&header.endpoint_id) else {
        warn!(endpoint_id = %header.endpoint_id, "Stream for an endpoint we do not serve");
        stream.reset();
        return;
    };

    let mut local = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(target)).await {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            warn!(endpoint_id = %header.endpoint_id, addr = target, error = %e, "Local target unreachable");
            stream.reset();
            return;
        }
        Err(_) => {
            warn!(endpoint_id = %header.endpoint_id, addr = target, "Local target connect timed out");
            stream.reset();
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut local).await {
        Ok((to_local, from_local)) => debug!(
            endpoint_id = %header.endpoint_id,
            correlation_id = %header.correlation_id,
            to_local,
            from_local,
            "Stream finished"
        ),
        Err(e) => debug!(
            endpoint_id = %header.endpoint_id,
            correlation_id = %header.correlation_id,
            error = %e,
            "Stream ended with error"
        ),
    }
}

/// Connect, serve and reconnect with jittered exponential backoff until
/// `shutdown` flips or the server rejects the registration.
pub async fn run(config: AgentConfig, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
    config.validate()?;
    let config = Arc::new(config);
    let mut delay = RECONNECT_INITIAL;
    let mut consecutive_failures = 0u32;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match Agent::connect(Arc::clone(&config)).await {
            Ok(agent) => {
                consecutive_failures = 0;
                delay = RECONNECT_INITIAL;
                match agent.serve(shutdown.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(error = %e, "Session ended, reconnecting"),
                }
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "Connect failed");
            }
        }

        let jitter = rand::rng().random_range(0..=delay.as_millis() as u64 / 4);
        let wait = delay + Duration::from_millis(jitter);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
        delay = (delay * 2).min(config.reconnect_max);
    }
}
