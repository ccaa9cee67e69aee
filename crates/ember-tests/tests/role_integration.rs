//! Role switching integration tests.

use std::time::Duration;

use ember_overlay::{OverlayError, OverlayEvent, Role};
use ember_tests::harness::wait_for;
use ember_tests::{TestNetwork, TestNodeConfig};

fn auto_edge() -> TestNodeConfig {
    TestNodeConfig {
        auto_rendezvous: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_isolated_edge_promotes_itself() {
    let mut network = TestNetwork::new();
    let node = network.add_node(auto_edge()).unwrap();
    let mut events = node.overlay.subscribe();

    assert_eq!(node.overlay.run_watchdog(), Some(Role::Rendezvous));
    assert_eq!(events.recv().await.unwrap(), OverlayEvent::BecameRendezvous);
    assert!(node.overlay.is_rendezvous());

    network.shutdown().await;
}

#[tokio::test]
async fn test_connected_edge_stays_edge() {
    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_node(auto_edge()).unwrap();
    network.connect_star(0).await.unwrap();

    assert_eq!(edge.overlay.run_watchdog(), None);
    assert_eq!(edge.overlay.role(), Role::Edge);

    network.shutdown().await;
}

#[tokio::test]
async fn test_demoted_rendezvous_releases_edges() {
    let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
    let edge = network.add_node(auto_edge()).unwrap();
    network.connect_star(0).await.unwrap();
    let rdv = network.node(0).unwrap().clone();
    let mut edge_events = edge.overlay.subscribe();

    rdv.overlay.stop_rendezvous().unwrap();
    assert_eq!(rdv.overlay.role(), Role::Edge);

    assert_eq!(
        edge_events.recv().await.unwrap(),
        OverlayEvent::RendezvousDisconnect(rdv.peer_id)
    );
    assert!(edge.overlay.connected_rendezvous().is_empty());

    // Left without a rendezvous, the edge takes over.
    assert_eq!(edge.overlay.run_watchdog(), Some(Role::Rendezvous));

    // The former rendezvous can lease from its old client now.
    rdv.connect_to(&edge).unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || {
            rdv.overlay.connected_rendezvous() == vec![edge.peer_id]
        })
        .await
    );

    network.shutdown().await;
}

#[tokio::test]
async fn test_adhoc_never_switches() {
    let mut network = TestNetwork::new();
    let node = network
        .add_node(TestNodeConfig {
            role: Role::AdHoc,
            auto_rendezvous: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(node.overlay.run_watchdog(), None);
    assert_eq!(
        node.overlay.start_rendezvous(),
        Err(OverlayError::InvalidRole(Role::AdHoc))
    );

    network.shutdown().await;
}
