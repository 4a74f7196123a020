mod harness;

use std::time::Duration;

use harness::{roundtrip, unused_addr, wait_until, TcpEchoBackend, TestAgent, TestNode};
use outpost_wire::ProxyStatus;

const CONVERGE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn local_endpoint_echoes_through_proxy() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let node = TestNode::spawn(Vec::new()).await;
    let _agent = TestAgent::connect(node.upstream_addr(), "web", backend.addr).await;

    assert!(wait_until(CONVERGE, || node.owner_of("web") == Some(node.id())).await);
    let echoed = roundtrip(node.proxy_addr(), "web", b"ping local").await.unwrap();
    assert_eq!(echoed, b"ping local");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn unknown_endpoint_is_not_found() {
    let node = TestNode::spawn(Vec::new()).await;
    let result = roundtrip(node.proxy_addr(), "missing", b"x").await;
    assert_eq!(result, Err(ProxyStatus::NotFound));
}

#[tokio::test]
async fn request_is_forwarded_to_owning_node() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    assert!(wait_until(CONVERGE, || a.sees_alive(b.id()) && b.sees_alive(a.id())).await);

    let _agent = TestAgent::connect(b.upstream_addr(), "api", backend.addr).await;
    assert!(wait_until(CONVERGE, || a.owner_of("api") == Some(b.id())).await);

    let echoed = roundtrip(a.proxy_addr(), "api", b"across the cluster").await.unwrap();
    assert_eq!(echoed, b"across the cluster");
}

#[tokio::test]
async fn dropped_upstream_becomes_not_found() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    assert!(wait_until(CONVERGE, || a.sees_alive(b.id())).await);

    let agent = TestAgent::connect(b.upstream_addr(), "svc", backend.addr).await;
    assert!(wait_until(CONVERGE, || a.owner_of("svc") == Some(b.id())).await);
    assert!(roundtrip(a.proxy_addr(), "svc", b"before").await.is_ok());

    agent.stop().await;
    assert!(wait_until(CONVERGE, || b.owner_of("svc").is_none()).await);
    assert!(wait_until(CONVERGE, || a.owner_of("svc").is_none()).await);

    assert_eq!(roundtrip(a.proxy_addr(), "svc", b"after").await, Err(ProxyStatus::NotFound));
    assert_eq!(roundtrip(b.proxy_addr(), "svc", b"after").await, Err(ProxyStatus::NotFound));
}

#[tokio::test]
async fn join_succeeds_past_unreachable_seed() {
    let a = TestNode::spawn(Vec::new()).await;
    let dead_seed = unused_addr().await.to_string();
    let b = TestNode::spawn(vec![dead_seed, a.seed()]).await;

    assert!(wait_until(CONVERGE, || a.sees_alive(b.id()) && b.sees_alive(a.id())).await);
}

#[tokio::test]
async fn late_seed_is_joined_in_background() {
    let seed_addr = unused_addr().await;
    // Nothing answers at the seed yet, so b starts alone and keeps retrying.
    let b = TestNode::spawn(vec![seed_addr.to_string()]).await;
    assert!(b.server.membership().unwrap().alive_peers().is_empty());

    let a = TestNode::spawn_at(seed_addr, Vec::new()).await;
    assert!(wait_until(CONVERGE, || a.sees_alive(b.id()) && b.sees_alive(a.id())).await);
}

#[tokio::test]
async fn dead_node_loses_its_endpoints() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    let b_id = b.id();
    assert!(wait_until(CONVERGE, || a.sees_alive(b_id)).await);

    let _agent = TestAgent::connect(b.upstream_addr(), "db", backend.addr).await;
    assert!(wait_until(CONVERGE, || a.owner_of("db") == Some(b_id)).await);

    // Dropping aborts b without a leave message; a must detect the failure.
    drop(b);
    assert!(wait_until(CONVERGE, || !a.sees_alive(b_id)).await);
    assert!(wait_until(CONVERGE, || a.owner_of("db").is_none()).await);
    assert_eq!(roundtrip(a.proxy_addr(), "db", b"gone").await, Err(ProxyStatus::NotFound));
}

#[tokio::test]
async fn graceful_leave_releases_endpoints() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let mut b = TestNode::spawn(vec![a.seed()]).await;
    let b_id = b.id();
    assert!(wait_until(CONVERGE, || a.sees_alive(b_id)).await);

    let _agent = TestAgent::connect(b.upstream_addr(), "cache", backend.addr).await;
    assert!(wait_until(CONVERGE, || a.owner_of("cache") == Some(b_id)).await);

    b.server.shutdown().await;
    assert!(!b.server.is_running());
    assert!(wait_until(Duration::from_secs(3), || a.owner_of("cache").is_none()).await);
    assert!(!a.sees_alive(b_id));
}

#[tokio::test]
async fn conflicting_claims_converge_on_latest() {
    let first = TcpEchoBackend::spawn().await.unwrap();
    let second = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    assert!(wait_until(CONVERGE, || a.sees_alive(b.id()) && b.sees_alive(a.id())).await);

    let _first = TestAgent::connect(a.upstream_addr(), "shared", first.addr).await;
    assert!(wait_until(CONVERGE, || b.owner_of("shared") == Some(a.id())).await);

    let _second = TestAgent::connect(b.upstream_addr(), "shared", second.addr).await;
    assert!(
        wait_until(CONVERGE, || {
            a.owner_of("shared") == Some(b.id()) && b.owner_of("shared") == Some(b.id())
        })
        .await
    );

    let echoed = roundtrip(a.proxy_addr(), "shared", b"who wins").await.unwrap();
    assert_eq!(echoed, b"who wins");
    assert_eq!(second.connection_count(), 1);
    assert_eq!(first.connection_count(), 0);
}

#[tokio::test]
async fn three_nodes_converge_through_a_join_chain() {
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    // c only knows b; it learns of a through the join reply and gossip.
    let c = TestNode::spawn(vec![b.seed()]).await;

    let nodes = [&a, &b, &c];
    assert!(
        wait_until(CONVERGE, || {
            nodes.iter().all(|n| {
                nodes.iter().filter(|m| m.id() != n.id()).all(|m| n.sees_alive(m.id()))
            })
        })
        .await
    );
    for node in nodes {
        assert_eq!(node.server.membership().unwrap().alive_peers().len(), 2);
    }
}

#[tokio::test]
async fn claim_on_far_node_is_routable_everywhere() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    let c = TestNode::spawn(vec![b.seed()]).await;
    assert!(wait_until(CONVERGE, || a.sees_alive(c.id()) && c.sees_alive(a.id())).await);

    let _agent = TestAgent::connect(c.upstream_addr(), "far", backend.addr).await;
    assert!(
        wait_until(CONVERGE, || {
            a.owner_of("far") == Some(c.id()) && b.owner_of("far") == Some(c.id())
        })
        .await
    );

    assert_eq!(roundtrip(a.proxy_addr(), "far", b"via a").await.unwrap(), b"via a");
    assert_eq!(roundtrip(b.proxy_addr(), "far", b"via b").await.unwrap(), b"via b");
    assert_eq!(backend.connection_count(), 2);
}

#[tokio::test]
async fn survivors_keep_routing_after_a_node_dies() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let a = TestNode::spawn(Vec::new()).await;
    let b = TestNode::spawn(vec![a.seed()]).await;
    let c = TestNode::spawn(vec![a.seed()]).await;
    let b_id = b.id();
    assert!(wait_until(CONVERGE, || c.sees_alive(b_id) && a.sees_alive(c.id())).await);

    let _agent = TestAgent::connect(c.upstream_addr(), "kept", backend.addr).await;
    assert!(wait_until(CONVERGE, || a.owner_of("kept") == Some(c.id())).await);

    drop(b);
    assert!(wait_until(CONVERGE, || !a.sees_alive(b_id) && !c.sees_alive(b_id)).await);
    assert!(a.sees_alive(c.id()));
    assert_eq!(roundtrip(a.proxy_addr(), "kept", b"still here").await.unwrap(), b"still here");
}
