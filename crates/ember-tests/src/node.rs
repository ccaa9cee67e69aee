//! Test node implementation for integration testing.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_core::{MessageId, NetworkKey, PeerId};
use ember_overlay::{OverlayConfig, OverlayError, RendezvousOverlay, Role, ServiceHandler};
use ember_srdi::{
    CoordinatorConfig, CredentialProvider, IndexCoordinator, NetworkCredential, SrdiPublisher,
    StorePublisher,
};
use ember_store::{Document, DocumentStore, SrdiLocalIndex, StoreConfig, StoreError};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::memory::MemoryNetwork;

/// Service name test payloads are propagated under.
pub const TEST_SERVICE: &str = "test";

/// Handler name of every node's index coordinator.
pub const INDEX_HANDLER: &str = "index";

/// Configuration for a test node.
#[derive(Debug, Clone)]
pub struct TestNodeConfig {
    /// Initial role
    pub role: Role,
    /// Let the watchdog switch roles
    pub auto_rendezvous: bool,
    /// Broadcast domain, `None` for none
    pub subnet: Option<u32>,
    /// Key for index message credentials
    pub network_key: Option<NetworkKey>,
    /// Push worker interval
    pub push_interval: Duration,
    /// Lease length
    pub lease_duration: Duration,
}

impl Default for TestNodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Edge,
            auto_rendezvous: false,
            subnet: None,
            network_key: None,
            push_interval: Duration::from_millis(200),
            lease_duration: Duration::from_secs(60),
        }
    }
}

/// Records payloads delivered to [`TEST_SERVICE`].
#[derive(Default)]
pub struct Inbox {
    received: Mutex<Vec<(PeerId, Bytes)>>,
}

impl Inbox {
    /// Payloads received so far.
    pub fn payloads(&self) -> Vec<Bytes> {
        self.received.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Number of payloads received.
    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    /// Returns true if nothing was received.
    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }
}

impl ServiceHandler for Inbox {
    fn on_message(&self, from: PeerId, _param: &str, payload: Bytes) {
        self.received.lock().push((from, payload));
    }
}

/// A test node: overlay, document store and index coordinator.
pub struct TestNode {
    /// Peer ID
    pub peer_id: PeerId,
    /// Overlay
    pub overlay: Arc<RendezvousOverlay>,
    /// Document store
    pub store: Arc<DocumentStore>,
    /// Index coordinator
    pub coordinator: Arc<IndexCoordinator>,
    /// Test service inbox
    pub inbox: Arc<Inbox>,
    publisher: Arc<StorePublisher>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Creates a node attached to `network`.
    pub fn new(
        network: &Arc<MemoryNetwork>,
        config: TestNodeConfig,
    ) -> Result<Arc<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let temp_dir = TempDir::new()?;
        let peer_id = PeerId::random();

        let overlay = RendezvousOverlay::new(
            OverlayConfig {
                auto_rendezvous: config.auto_rendezvous,
                lease_duration: config.lease_duration,
                ..OverlayConfig::with_role(config.role)
            },
            network.endpoint(peer_id),
        );
        network.attach(&overlay, config.subnet);

        let store_config = StoreConfig::new(temp_dir.path());
        let store = Arc::new(DocumentStore::open(&store_config, "cm")?);
        let index = Arc::new(SrdiLocalIndex::open(&store_config, INDEX_HANDLER)?);

        let credentials = config.network_key.map(|key| {
            let provider: Arc<dyn CredentialProvider> = Arc::new(NetworkCredential::new(key));
            provider
        });
        let coordinator = IndexCoordinator::new(
            CoordinatorConfig {
                push_interval: config.push_interval,
                membership_wait_interval: config.push_interval,
                ..CoordinatorConfig::new(INDEX_HANDLER)
            },
            Arc::clone(&overlay),
            index,
            credentials,
        );
        let publisher = Arc::new(StorePublisher::new(Arc::clone(&store), &coordinator));
        coordinator.set_publisher(publisher.clone());

        let inbox = Arc::new(Inbox::default());
        overlay.register_handler(TEST_SERVICE, inbox.clone());

        info!(peer = %peer_id, role = config.role.name(), "Created test node");

        Ok(Arc::new(Self {
            peer_id,
            overlay,
            store,
            coordinator,
            inbox,
            publisher,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            _temp_dir: temp_dir,
        }))
    }

    /// Starts background workers.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        handles.extend(self.overlay.start(self.cancel.child_token()));
        handles.extend(self.coordinator.start(self.cancel.child_token()));
        handles.push(self.store.spawn_gc(self.cancel.child_token()));
    }

    /// Addresses other nodes can use for this node.
    pub fn addresses(&self) -> Vec<String> {
        vec![format!("mem://{}", self.peer_id)]
    }

    /// Requests a lease from `other`.
    pub fn connect_to(&self, other: &TestNode) -> Result<(), OverlayError> {
        self.overlay.connect(other.peer_id, &other.addresses())
    }

    /// Propagates a test payload.
    pub fn propagate(&self, payload: &'static [u8], ttl: i32) -> MessageId {
        self.overlay
            .propagate(TEST_SERVICE, "", Bytes::from_static(payload), Some(ttl))
    }

    /// Saves a shareable document carrying one attribute.
    pub fn publish(
        &self,
        dir: &str,
        name: &str,
        attr: &str,
        value: &str,
        lifetime: Duration,
    ) -> Result<(), StoreError> {
        let document = Document::new(Bytes::copy_from_slice(name.as_bytes()))
            .with_attribute(attr, value);
        self.store.save(dir, name, &document, lifetime, lifetime)
    }

    /// Runs one push through the publisher outside the worker schedule.
    pub fn push(&self, all: bool) {
        self.publisher.push_entries(all);
    }

    /// Peers this node's index knows for `(pk, attr, value)`.
    pub fn lookup(&self, pk: &str, attr: &str, value: &str) -> Vec<PeerId> {
        self.coordinator
            .index()
            .query(pk, Some(attr), Some(value), 100)
            .unwrap_or_default()
    }

    /// Number of live connections in both directions.
    pub fn connection_count(&self) -> usize {
        self.overlay.connected_clients().len() + self.overlay.connected_rendezvous().len()
    }

    /// Stops background workers and says goodbye to connected peers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.overlay.shutdown();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
