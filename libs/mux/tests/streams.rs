//! Session behavior over a real TCP transport.

use std::io;
use std::time::Duration;

use outpost_mux::{MuxConfig, Role, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn tcp_pair(config: MuxConfig) -> (Session, Session) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let client = Session::new(dialed.unwrap(), Role::Client, config.clone());
    let server = Session::new(accepted.unwrap().0, Role::Server, config);
    (client, server)
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

#[tokio::test]
async fn concurrent_streams_do_not_interleave() {
    let (client, server) = tcp_pair(MuxConfig::default()).await;

    let echo = tokio::spawn(async move {
        let mut tasks = Vec::new();
        while let Some(mut stream) = server.accept().await {
            tasks.push(tokio::spawn(async move {
                let (mut r, mut w) = tokio::io::split(&mut stream);
                tokio::io::copy(&mut r, &mut w).await.unwrap();
                drop((r, w));
                stream.shutdown().await.unwrap();
            }));
            if tasks.len() == 16 {
                break;
            }
        }
        for task in tasks {
            task.await.unwrap();
        }
        server
    });

    let mut clients = Vec::new();
    for seed in 0..16u8 {
        let mut stream = client.open_stream().unwrap();
        clients.push(tokio::spawn(async move {
            let payload = pattern(seed, 200 * 1024 + seed as usize);
            let (mut r, mut w) = tokio::io::split(&mut stream);
            let expected = payload.clone();
            let writer = async move {
                w.write_all(&payload).await.unwrap();
                w.shutdown().await.unwrap();
            };
            let reader = async move {
                let mut got = Vec::new();
                r.read_to_end(&mut got).await.unwrap();
                got
            };
            let ((), got) = tokio::join!(writer, reader);
            assert_eq!(got.len(), expected.len());
            assert!(got == expected, "stream {seed} payload corrupted");
        }));
    }

    for task in clients {
        task.await.unwrap();
    }
    let _server = echo.await.unwrap();
}

#[tokio::test]
async fn writer_blocks_until_reader_grants_credit() {
    let config = MuxConfig {
        initial_window: 32 * 1024,
        ..MuxConfig::default()
    };
    let (client, server) = tcp_pair(config).await;

    let mut sender = client.open_stream().unwrap();
    let mut receiver = server.accept().await.unwrap();

    let total = 512 * 1024;
    let write = tokio::spawn(async move {
        sender.write_all(&pattern(3, total)).await.unwrap();
        sender.shutdown().await.unwrap();
        sender
    });

    // The receiver has not read yet, so the sender must stall on credit.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!write.is_finished());

    let mut got = Vec::new();
    receiver.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, pattern(3, total));
    let _sender = write.await.unwrap();
}

#[tokio::test]
async fn dropping_session_fails_every_stream() {
    let (client, server) = tcp_pair(MuxConfig::default()).await;

    let mut a = client.open_stream().unwrap();
    let mut b = client.open_stream().unwrap();
    let _ra = server.accept().await.unwrap();
    let _rb = server.accept().await.unwrap();

    drop(server);

    let mut buf = [0u8; 16];
    let err_a = tokio::time::timeout(Duration::from_secs(2), a.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    let err_b = tokio::time::timeout(Duration::from_secs(2), b.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err_a.kind(), io::ErrorKind::ConnectionAborted);
    assert_eq!(err_b.kind(), io::ErrorKind::ConnectionAborted);
    assert!(client.is_closed());
}

#[tokio::test]
async fn dropped_stream_resets_peer() {
    let (client, server) = tcp_pair(MuxConfig::default()).await;

    let stream = client.open_stream().unwrap();
    let mut peer = server.accept().await.unwrap();
    drop(stream);

    let mut buf = [0u8; 4];
    let err = peer.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

    // The session itself survives a single reset.
    assert!(!client.is_closed());
    assert!(client.open_stream().is_ok());
}

#[tokio::test]
async fn garbage_on_transport_closes_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let session = Session::new(accepted.unwrap().0, Role::Server, MuxConfig::default());

    let mut raw = dialed.unwrap();
    raw.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), session.closed())
        .await
        .expect("session should close on a malformed frame");
}
