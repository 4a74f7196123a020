use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use outpost_agent::{Agent, AgentConfig, AgentError};
use outpost_id::{ConnectionId, CorrelationId, EndpointId};
use outpost_mux::{MuxConfig, Role, Session};
use outpost_wire::{read_message, write_message, RegisterRequest, RegisterResponse, StreamOpen};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Accepts one upstream, answers its registration with `verdict` and hands
/// back the request plus the session when accepted.
async fn fake_server(
    verdict: RegisterResponse,
) -> (SocketAddr, oneshot::Receiver<(RegisterRequest, Option<Session>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request: RegisterRequest = read_message(&mut socket).await.unwrap();
        let accepted = verdict.accepted;
        write_message(&mut socket, &verdict).await.unwrap();
        let session = accepted.then(|| Session::new(socket, Role::Server, MuxConfig::default()));
        let _ = tx.send((request, session));
    });
    (addr, rx)
}

fn config(server: SocketAddr, endpoint: &str, target: SocketAddr) -> AgentConfig {
    AgentConfig::new(server.to_string(), "secret")
        .with_endpoint(format!("{endpoint}={target}").parse().unwrap())
}

#[tokio::test]
async fn registers_and_bridges_streams_to_target() {
    let echo = spawn_echo().await;
    let connection_id = ConnectionId::new();
    let (server, registered) = fake_server(RegisterResponse::accept(connection_id)).await;

    let mut cfg = config(server, "web", echo);
    cfg.name = Some("test-agent".to_string());
    let agent = Agent::connect(Arc::new(cfg)).await.unwrap();
    assert_eq!(agent.connection_id(), connection_id);

    let (request, session) = registered.await.unwrap();
    assert_eq!(request.credential, "secret");
    assert_eq!(request.endpoints, vec![EndpointId::parse("web").unwrap()]);
    assert_eq!(request.agent.as_deref(), Some("test-agent"));
    let session = session.unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(agent.serve(shutdown_rx));

    let mut stream = session.open_stream().unwrap();
    let header = StreamOpen {
        endpoint_id: EndpointId::parse("web").unwrap(),
        correlation_id: CorrelationId::new(),
    };
    write_message(&mut stream, &header).await.unwrap();
    stream.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = vec![0u8; b"hello through the tunnel".len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
}

#[tokio::test]
async fn unknown_endpoint_stream_is_reset() {
    let echo = spawn_echo().await;
    let (server, registered) = fake_server(RegisterResponse::accept(ConnectionId::new())).await;
    let agent = Agent::connect(Arc::new(config(server, "web", echo))).await.unwrap();
    let (_, session) = registered.await.unwrap();
    let session = session.unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(agent.serve(shutdown_rx));

    let mut stream = session.open_stream().unwrap();
    let header = StreamOpen {
        endpoint_id: EndpointId::parse("other").unwrap(),
        correlation_id: CorrelationId::new(),
    };
    write_message(&mut stream, &header).await.unwrap();

    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn rejection_is_not_retried() {
    let echo = spawn_echo().await;
    let (server, _registered) = fake_server(RegisterResponse::reject("bad credential")).await;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = timeout(
        Duration::from_secs(5),
        outpost_agent::run(config(server, "web", echo), shutdown_rx),
    )
    .await
    .unwrap();

    match result {
        Err(AgentError::Rejected(reason)) => assert_eq!(reason, "bad credential"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_stops_serving() {
    let echo = spawn_echo().await;
    let (server, registered) = fake_server(RegisterResponse::accept(ConnectionId::new())).await;
    let agent = Agent::connect(Arc::new(config(server, "web", echo))).await.unwrap();
    let (_, session) = registered.await.unwrap();
    let session = session.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(agent.serve(shutdown_rx));
    shutdown_tx.send(true).unwrap();

    let result = timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
    assert!(result.is_ok());
    timeout(Duration::from_secs(5), session.closed()).await.unwrap();
}
