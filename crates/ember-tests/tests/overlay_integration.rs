//! Overlay integration tests.
//!
//! Tests for propagation across a live network including:
//! - Lease handshakes in star and mesh topologies
//! - TTL exhaustion, duplicate suppression and loop prevention
//! - Walks along the rendezvous ring
//! - Local subnet broadcast

use std::time::Duration;

use ember_overlay::{OverlayEvent, Role};
use ember_tests::harness::wait_for;
use ember_tests::{TestNetwork, TestNodeConfig};

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ember_tests=debug,ember_overlay=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_edge_leases_from_rendezvous() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    let rdv = network.node(0).unwrap().clone();
    let mut events = rdv.overlay.subscribe();

    edge.connect_to(&rdv).unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        OverlayEvent::ClientConnect(edge.peer_id)
    );
    assert!(
        wait_for(Duration::from_secs(2), || {
            edge.overlay.connected_rendezvous() == vec![rdv.peer_id]
        })
        .await
    );

    // A renewal is a reconnect, not a new client.
    edge.connect_to(&rdv).unwrap();
    assert_eq!(
        events.recv().await.unwrap(),
        OverlayEvent::ClientReconnect(edge.peer_id)
    );

    network.shutdown().await;
}

#[tokio::test]
async fn test_single_hop_ttl_is_not_repropagated() {
    init_tracing();

    let network = TestNetwork::with_nodes(3, Role::Rendezvous).unwrap();
    network.connect_mesh().await.unwrap();
    let nodes = network.nodes();

    nodes[0].propagate(b"one hop", 1);

    assert!(
        wait_for(Duration::from_secs(2), || {
            nodes[1..].iter().all(|n| n.inbox.len() == 1)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    for node in &nodes[1..] {
        assert_eq!(node.inbox.len(), 1);
        assert_eq!(node.overlay.stats().sent, 0, "receiver must not forward");
    }
    assert!(nodes[0].inbox.is_empty());

    network.shutdown().await;
}

#[tokio::test]
async fn test_duplicates_delivered_once() {
    init_tracing();

    let network = TestNetwork::with_nodes(4, Role::Rendezvous).unwrap();
    network.connect_mesh().await.unwrap();
    let nodes = network.nodes();

    nodes[0].propagate(b"flood", 5);

    assert!(
        wait_for(Duration::from_secs(2), || {
            nodes[1..].iter().all(|n| n.inbox.len() == 1)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    for node in &nodes[1..] {
        assert_eq!(node.inbox.payloads(), vec![bytes::Bytes::from_static(b"flood")]);
    }
    // The origin never delivers its own message.
    assert!(nodes[0].inbox.is_empty());

    let suppressed: u64 = nodes
        .iter()
        .map(|n| {
            let stats = n.overlay.stats();
            stats.duplicates + stats.loops
        })
        .sum();
    assert!(suppressed > 0);

    network.print_stats();
    network.shutdown().await;
}

#[tokio::test]
async fn test_edges_reach_each_other_through_rendezvous() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    for _ in 0..3 {
        network.add_role(Role::Edge).unwrap();
    }
    network.connect_star(0).await.unwrap();
    let nodes = network.nodes();

    nodes[1].propagate(b"from edge", 3);

    assert!(
        wait_for(Duration::from_secs(2), || {
            nodes[2].inbox.len() == 1 && nodes[3].inbox.len() == 1
        })
        .await
    );
    assert_eq!(nodes[0].inbox.len(), 1);
    assert!(nodes[1].inbox.is_empty());

    // Edges never forward.
    for edge in &nodes[2..] {
        assert_eq!(edge.overlay.stats().sent, 0);
    }

    network.shutdown().await;
}

#[tokio::test]
async fn test_walk_follows_ring() {
    init_tracing();

    let network = TestNetwork::with_nodes(4, Role::Rendezvous).unwrap();
    network.connect_mesh().await.unwrap();
    let nodes = network.nodes();

    let targets = vec![nodes[1].peer_id];
    nodes[0].overlay.walk(
        &targets,
        ember_tests::node::TEST_SERVICE,
        "",
        bytes::Bytes::from_static(b"walker"),
        Some(10),
    );

    // The walk visits every rendezvous once and stops when none is left.
    assert!(
        wait_for(Duration::from_secs(2), || {
            nodes[1..].iter().all(|n| n.inbox.len() == 1)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    for node in nodes {
        assert!(node.inbox.len() <= 1);
    }

    network.shutdown().await;
}

#[tokio::test]
async fn test_subnet_broadcast_reaches_adhoc_peers() {
    init_tracing();

    let mut network = TestNetwork::new();
    let config = TestNodeConfig {
        role: Role::AdHoc,
        subnet: Some(7),
        ..Default::default()
    };
    let a = network.add_node(config.clone()).unwrap();
    let b = network.add_node(config.clone()).unwrap();
    let outsider = network
        .add_node(TestNodeConfig {
            subnet: Some(8),
            ..config
        })
        .unwrap();

    a.propagate(b"nearby", 2);

    assert!(wait_for(Duration::from_secs(2), || b.inbox.len() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(outsider.inbox.is_empty());
    assert!(a.inbox.is_empty());

    network.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_client_reported_failed() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();
    let mut events = rdv.overlay.subscribe();

    network.transport.set_reachable(&edge.peer_id, false);
    rdv.propagate(b"lost", 2);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, OverlayEvent::ClientFailed(edge.peer_id));
    assert!(rdv.overlay.connected_clients().is_empty());

    network.shutdown().await;
}
