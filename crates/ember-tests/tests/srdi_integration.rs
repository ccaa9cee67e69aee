//! Distributed index integration tests.
//!
//! Tests for index publication across a live network including:
//! - Edge pushes reaching their rendezvous
//! - Replication to deterministic replicas
//! - Tombstones withdrawing remote claims
//! - Credential checks and departure cleanup

use std::time::Duration;

use ember_core::NetworkKey;
use ember_overlay::Role;
use ember_tests::harness::wait_for;
use ember_tests::{TestNetwork, TestNodeConfig};

const LIFETIME: Duration = Duration::from_secs(60);

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("ember_tests=debug,ember_srdi=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_edge_entries_reach_rendezvous() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();

    edge.publish("Peers", "p1", "Name", "alpha", LIFETIME).unwrap();
    edge.push(false);

    assert!(
        wait_for(Duration::from_secs(2), || {
            rdv.lookup("Peers", "Name", "alpha") == vec![edge.peer_id]
        })
        .await
    );
    assert_eq!(rdv.lookup("Peers", "Name", "al*"), vec![edge.peer_id]);
    assert!(rdv.lookup("Peers", "Name", "beta").is_empty());

    network.shutdown().await;
}

#[tokio::test]
async fn test_push_worker_publishes_without_prompting() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    edge.publish("Peers", "p1", "Name", "early", LIFETIME).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();

    // The lease grant wakes the worker for a full republish.
    assert!(
        wait_for(Duration::from_secs(3), || {
            rdv.lookup("Peers", "Name", "early") == vec![edge.peer_id]
        })
        .await
    );
    assert!(edge.coordinator.stats().full_pushes >= 1);

    network.shutdown().await;
}

#[tokio::test]
async fn test_entries_replicated_to_replicas() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(4, Role::Rendezvous).unwrap();
    network.connect_mesh().await.unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    let entry = network.node(0).unwrap().clone();
    edge.connect_to(&entry).unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || {
            edge.overlay.connected_rendezvous() == vec![entry.peer_id]
        })
        .await
    );

    let values: Vec<String> = (0..8).map(|i| format!("value{i}")).collect();
    for (i, value) in values.iter().enumerate() {
        edge.publish("Peers", &format!("p{i}"), "Name", value, LIFETIME)
            .unwrap();
    }
    edge.push(false);

    for value in &values {
        let replica = entry
            .coordinator
            .get_replica_peer(&format!("PeersName{value}"))
            .expect("four rendezvous is enough to replicate");
        let holder = network.node_by_id(&replica).unwrap().clone();

        assert!(
            wait_for(Duration::from_secs(2), || {
                holder.lookup("Peers", "Name", value) == vec![edge.peer_id]
            })
            .await,
            "replica {replica} missing {value}"
        );
    }

    // Every rendezvous agrees on placement.
    for node in &network.nodes()[1..4] {
        assert_eq!(
            node.coordinator.get_replica_peer("PeersNamevalue0"),
            entry.coordinator.get_replica_peer("PeersNamevalue0")
        );
    }

    network.print_stats();
    network.shutdown().await;
}

#[tokio::test]
async fn test_removal_withdraws_claim() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();

    edge.publish("Peers", "p1", "Name", "alpha", LIFETIME).unwrap();
    edge.push(false);
    assert!(
        wait_for(Duration::from_secs(2), || {
            !rdv.lookup("Peers", "Name", "alpha").is_empty()
        })
        .await
    );

    assert!(edge.store.remove("Peers", "p1").unwrap());
    edge.push(false);
    assert!(
        wait_for(Duration::from_secs(2), || {
            rdv.lookup("Peers", "Name", "alpha").is_empty()
        })
        .await
    );

    network.shutdown().await;
}

#[tokio::test]
async fn test_foreign_credentials_rejected() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let rdv = network.node(0).unwrap().clone();
    let rogue = network
        .add_node(TestNodeConfig {
            network_key: Some(NetworkKey::random()),
            ..Default::default()
        })
        .unwrap();
    network.connect_star(0).await.unwrap();

    rogue
        .publish("Peers", "p1", "Name", "intruder", LIFETIME)
        .unwrap();
    rogue.push(true);

    assert!(
        wait_for(Duration::from_secs(2), || {
            rdv.coordinator.stats().rejected >= 1
        })
        .await
    );
    assert!(rdv.lookup("Peers", "Name", "intruder").is_empty());

    network.shutdown().await;
}

#[tokio::test]
async fn test_departed_peer_claims_hidden() {
    init_tracing();

    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_role(Role::Edge).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();

    edge.publish("Peers", "p1", "Name", "alpha", LIFETIME).unwrap();
    edge.push(false);
    assert!(
        wait_for(Duration::from_secs(2), || {
            !rdv.lookup("Peers", "Name", "alpha").is_empty()
        })
        .await
    );

    edge.overlay.disconnect(&rdv.peer_id);
    assert!(
        wait_for(Duration::from_secs(2), || {
            rdv.lookup("Peers", "Name", "alpha").is_empty()
        })
        .await
    );
    assert_eq!(rdv.coordinator.index().stats().pending_garbage, 1);

    // The next GC pass reclaims the hidden claim.
    assert_eq!(rdv.coordinator.index().garbage_collect().unwrap(), 1);
    assert_eq!(rdv.coordinator.index().stats().claims, 0);

    network.shutdown().await;
}
