//! Test network harness for multi-node integration testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_core::{NetworkKey, PeerId};
use ember_overlay::Role;
use tokio::time::sleep;
use tracing::info;

use crate::memory::MemoryNetwork;
use crate::node::{TestNode, TestNodeConfig};

type HarnessResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A test network containing multiple nodes.
pub struct TestNetwork {
    /// Network key shared by all nodes
    pub network_key: NetworkKey,
    /// Transport connecting the nodes
    pub transport: Arc<MemoryNetwork>,
    /// Nodes in the network
    nodes: Vec<Arc<TestNode>>,
    /// Node lookup by ID
    node_map: HashMap<PeerId, Arc<TestNode>>,
}

impl TestNetwork {
    /// Creates a new empty test network.
    pub fn new() -> Self {
        Self {
            network_key: NetworkKey::random(),
            transport: MemoryNetwork::new(),
            nodes: Vec::new(),
            node_map: HashMap::new(),
        }
    }

    /// Creates a test network with `count` nodes in `role`.
    pub fn with_nodes(count: usize, role: Role) -> HarnessResult<Self> {
        let mut network = Self::new();
        for _ in 0..count {
            network.add_role(role)?;
        }
        Ok(network)
    }

    /// Adds a started node with `config` as given.
    pub fn add_node(&mut self, config: TestNodeConfig) -> HarnessResult<Arc<TestNode>> {
        let node = TestNode::new(&self.transport, config)?;
        node.start();

        self.nodes.push(Arc::clone(&node));
        self.node_map.insert(node.peer_id, Arc::clone(&node));

        info!(peer = %node.peer_id, total = self.nodes.len(), "Added node to test network");
        Ok(node)
    }

    /// Adds a node in `role` holding the shared network key.
    pub fn add_role(&mut self, role: Role) -> HarnessResult<Arc<TestNode>> {
        self.add_node(TestNodeConfig {
            role,
            network_key: Some(self.network_key.clone()),
            ..Default::default()
        })
    }

    /// Returns the number of nodes in the network.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns all nodes in the network.
    pub fn nodes(&self) -> &[Arc<TestNode>] {
        &self.nodes
    }

    /// Returns a node by index.
    pub fn node(&self, index: usize) -> Option<&Arc<TestNode>> {
        self.nodes.get(index)
    }

    /// Returns a node by ID.
    pub fn node_by_id(&self, id: &PeerId) -> Option<&Arc<TestNode>> {
        self.node_map.get(id)
    }

    /// Has every node lease from every other node. Only rendezvous nodes
    /// grant, so this suits all-rendezvous networks.
    pub async fn connect_mesh(&self) -> HarnessResult<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            for (j, other) in self.nodes.iter().enumerate() {
                if i != j {
                    node.connect_to(other)?;
                }
            }
        }

        let peers = self.nodes.len().saturating_sub(1);
        self.wait_for_connections(2 * peers, Duration::from_secs(5))
            .await?;
        info!(nodes = self.nodes.len(), "Connected nodes in mesh topology");
        Ok(())
    }

    /// Connects every other node to the hub at `hub`.
    pub async fn connect_star(&self, hub: usize) -> HarnessResult<()> {
        let hub_node = self.nodes.get(hub).ok_or("No such hub")?;
        for (i, spoke) in self.nodes.iter().enumerate() {
            if i != hub {
                spoke.connect_to(hub_node)?;
            }
        }

        let spokes = self.nodes.len().saturating_sub(1);
        let ready = wait_for(Duration::from_secs(5), || {
            hub_node.overlay.connected_clients().len() >= spokes
                && self.nodes.iter().enumerate().all(|(i, n)| {
                    i == hub || n.overlay.connected_rendezvous().contains(&hub_node.peer_id)
                })
        })
        .await;
        if !ready {
            return Err("Timeout waiting for star".into());
        }
        info!(nodes = self.nodes.len(), "Connected nodes in star topology");
        Ok(())
    }

    /// Waits for all nodes to have at least `min_connections` live
    /// connections.
    pub async fn wait_for_connections(
        &self,
        min_connections: usize,
        timeout: Duration,
    ) -> Result<(), &'static str> {
        let ready = wait_for(timeout, || {
            self.nodes
                .iter()
                .all(|n| n.connection_count() >= min_connections)
        })
        .await;
        if ready {
            Ok(())
        } else {
            Err("Timeout waiting for connections")
        }
    }

    /// Returns total connection count across all nodes.
    pub fn total_connections(&self) -> usize {
        self.nodes.iter().map(|n| n.connection_count()).sum()
    }

    /// Stops every node.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }

    /// Prints network statistics.
    pub fn print_stats(&self) {
        println!("\n=== Test Network Stats ===");
        println!("Nodes: {}", self.nodes.len());
        println!("Network Key: {}", hex::encode(self.network_key.as_bytes()));

        for (i, node) in self.nodes.iter().enumerate() {
            println!(
                "  Node {}: {} ({}, connections: {}, view: {})",
                i,
                node.peer_id,
                node.overlay.role().name(),
                node.connection_count(),
                node.overlay.view().len()
            );
        }
        println!("Frames delivered: {}", self.transport.frames_delivered());
        println!("==========================\n");
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_network_creation() {
        let network = TestNetwork::new();
        assert_eq!(network.node_count(), 0);
    }

    #[tokio::test]
    async fn test_network_with_nodes() {
        let network = TestNetwork::with_nodes(3, Role::Rendezvous).unwrap();
        assert_eq!(network.node_count(), 3);
        let first = network.node(0).unwrap();
        assert!(network.node_by_id(&first.peer_id).is_some());
    }

    #[tokio::test]
    async fn test_network_mesh_connection() {
        let network = TestNetwork::with_nodes(3, Role::Rendezvous).unwrap();
        network.connect_mesh().await.unwrap();

        // Each node leases from 2 peers and grants to 2 peers.
        assert_eq!(network.total_connections(), 12);
        for node in network.nodes() {
            assert_eq!(node.overlay.view().len(), 2);
        }
        network.shutdown().await;
    }

    #[tokio::test]
    async fn test_network_star_connection() {
        let mut network = TestNetwork::with_nodes(1, Role::Rendezvous).unwrap();
        for _ in 0..3 {
            network.add_role(Role::Edge).unwrap();
        }
        network.connect_star(0).await.unwrap();

        let hub = network.node(0).unwrap();
        assert_eq!(hub.overlay.connected_clients().len(), 3);
        assert!(hub.overlay.view().is_empty());
        for edge in &network.nodes()[1..] {
            assert_eq!(edge.overlay.connected_rendezvous(), vec![hub.peer_id]);
        }
        network.shutdown().await;
    }
}
