//! Leased connection to one remote peer.
//!
//! A connection starts disconnected, becomes connected when a lease is
//! granted and falls back to disconnected on send failure, explicit close
//! or lease expiry. Expiry is checked lazily on access. A connection that
//! has been lost is never reused; reconnecting needs a fresh object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_core::{PeerId, Timestamp};
use ember_proto::Message;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::endpoint::{Endpoint, Messenger};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No lease
    Disconnected,
    /// Lease held
    Connected,
}

struct ConnInner {
    state: ConnectionState,
    terminated: bool,
    lease: Duration,
    lease_end: Timestamp,
    addresses: Vec<String>,
    messenger: Option<Arc<dyn Messenger>>,
}

impl ConnInner {
    fn check_lease(&mut self, now: Timestamp) {
        if self.state == ConnectionState::Connected && self.lease_end.has_passed(now) {
            self.state = ConnectionState::Disconnected;
            self.terminated = true;
        }
    }
}

/// Connection to a remote peer.
pub struct PeerConnection {
    peer_id: PeerId,
    endpoint: Arc<dyn Endpoint>,
    inner: Mutex<ConnInner>,
    failures: Option<mpsc::UnboundedSender<PeerId>>,
    messages_sent: AtomicU64,
}

impl PeerConnection {
    /// Creates a disconnected connection. Send failures are reported on
    /// `failures` when given.
    pub fn new(
        peer_id: PeerId,
        endpoint: Arc<dyn Endpoint>,
        addresses: Vec<String>,
        failures: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Self {
        Self {
            peer_id,
            endpoint,
            inner: Mutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                terminated: false,
                lease: Duration::ZERO,
                lease_end: Timestamp::default(),
                addresses,
                messenger: None,
            }),
            failures,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Remote peer.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Current state, after checking lease expiry.
    pub fn state(&self) -> ConnectionState {
        let mut inner = self.inner.lock();
        inner.check_lease(Timestamp::now());
        inner.state
    }

    /// Returns true while the lease holds.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns true once the connection has been lost for good.
    pub fn is_terminated(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.check_lease(Timestamp::now());
        inner.terminated
    }

    /// Starts or renews the lease. Returns false for a terminated
    /// connection, which must be replaced instead.
    pub fn set_connected(&self, lease: Duration, addresses: &[String]) -> bool {
        let now = Timestamp::now();
        let mut inner = self.inner.lock();
        inner.check_lease(now);
        if inner.terminated {
            return false;
        }
        inner.state = ConnectionState::Connected;
        inner.lease = lease;
        inner.lease_end = now.add(lease);
        if !addresses.is_empty() {
            inner.addresses = addresses.to_vec();
        }
        true
    }

    /// Ends the connection.
    pub fn set_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Disconnected;
        inner.terminated = true;
        inner.messenger = None;
    }

    /// Length of the current lease.
    pub fn lease(&self) -> Duration {
        self.inner.lock().lease
    }

    /// Time left on the lease, `None` when not connected.
    pub fn lease_remaining(&self) -> Option<Duration> {
        let now = Timestamp::now();
        let mut inner = self.inner.lock();
        inner.check_lease(now);
        match inner.state {
            ConnectionState::Connected => inner.lease_end.remaining(now),
            ConnectionState::Disconnected => None,
        }
    }

    /// Addresses advertised by the peer.
    pub fn addresses(&self) -> Vec<String> {
        self.inner.lock().addresses.clone()
    }

    /// Messages handed to the transport so far.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Queues `message` on a leased connection. Returns false if there is
    /// no lease or no route. The outcome of the send itself is observed in
    /// the background; a failure disconnects.
    pub fn send_message(self: &Arc<Self>, message: Message) -> bool {
        self.dispatch(message, true)
    }

    /// Queues a lease negotiation message, which needs no lease.
    pub fn send_control(self: &Arc<Self>, message: Message) -> bool {
        self.dispatch(message, false)
    }

    fn dispatch(self: &Arc<Self>, message: Message, require_lease: bool) -> bool {
        let messenger = {
            let mut inner = self.inner.lock();
            inner.check_lease(Timestamp::now());
            if inner.terminated
                || (require_lease && inner.state != ConnectionState::Connected)
            {
                return false;
            }

            let cached = inner
                .messenger
                .as_ref()
                .filter(|m| !m.is_closed())
                .cloned();
            match cached {
                Some(m) => m,
                None => match self.endpoint.messenger(&self.peer_id, &inner.addresses) {
                    Some(m) => {
                        inner.messenger = Some(Arc::clone(&m));
                        m
                    }
                    None => {
                        drop(inner);
                        self.fail("no route");
                        return false;
                    }
                },
            }
        };

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = messenger.send(message).await {
                conn.fail(&e.to_string());
            }
        });
        true
    }

    fn fail(&self, reason: &str) {
        let was_connected = {
            let mut inner = self.inner.lock();
            let was = inner.state == ConnectionState::Connected;
            inner.state = ConnectionState::Disconnected;
            inner.terminated = true;
            inner.messenger = None;
            was
        };
        if was_connected {
            warn!(peer = %self.peer_id, reason, "Connection failed");
        } else {
            debug!(peer = %self.peer_id, reason, "Send on idle connection failed");
        }
        if let Some(failures) = &self.failures {
            let _ = failures.send(self.peer_id);
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .field("state", &inner.state)
            .field("terminated", &inner.terminated)
            .field("lease_end", &inner.lease_end)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::endpoint::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Messenger recording what it sends.
    pub(crate) struct RecordingMessenger {
        pub sent: Mutex<Vec<Message>>,
        pub fail: AtomicBool,
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn send(&self, message: Message) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("refused".into()));
            }
            self.sent.lock().push(message);
            Ok(())
        }
    }

    /// Endpoint handing out one recording messenger per peer.
    pub(crate) struct RecordingEndpoint {
        pub local: PeerId,
        pub messengers: Mutex<std::collections::HashMap<PeerId, Arc<RecordingMessenger>>>,
        pub broadcasts: Mutex<Vec<Message>>,
        pub reachable: AtomicBool,
        pub resolved: AtomicU64,
    }

    impl RecordingEndpoint {
        pub(crate) fn new(local: PeerId) -> Arc<Self> {
            Arc::new(Self {
                local,
                messengers: Mutex::new(Default::default()),
                broadcasts: Mutex::new(Vec::new()),
                reachable: AtomicBool::new(true),
                resolved: AtomicU64::new(0),
            })
        }

        pub(crate) fn messenger_for(&self, peer: &PeerId) -> Arc<RecordingMessenger> {
            Arc::clone(self.messengers.lock().entry(*peer).or_insert_with(|| {
                Arc::new(RecordingMessenger {
                    sent: Mutex::new(Vec::new()),
                    fail: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                })
            }))
        }

        pub(crate) fn sent_to(&self, peer: &PeerId) -> Vec<Message> {
            self.messenger_for(peer).sent.lock().clone()
        }
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        fn local_peer(&self) -> PeerId {
            self.local
        }

        fn local_addresses(&self) -> Vec<String> {
            vec![format!("mem://{}", self.local)]
        }

        fn messenger(&self, peer: &PeerId, _hints: &[String]) -> Option<Arc<dyn Messenger>> {
            if !self.reachable.load(Ordering::SeqCst) {
                return None;
            }
            self.resolved.fetch_add(1, Ordering::SeqCst);
            let messenger: Arc<dyn Messenger> = self.messenger_for(peer);
            Some(messenger)
        }

        async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
            self.broadcasts.lock().push(message);
            Ok(())
        }
    }

    pub(crate) async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn connection(
        endpoint: &Arc<RecordingEndpoint>,
        failures: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> (PeerId, Arc<PeerConnection>) {
        let peer = PeerId::random();
        let endpoint: Arc<dyn Endpoint> = Arc::clone(endpoint) as Arc<dyn Endpoint>;
        let conn = Arc::new(PeerConnection::new(peer, endpoint, Vec::new(), failures));
        (peer, conn)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        let (peer, conn) = connection(&endpoint, None);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.send_message(Message::Disconnect));

        assert!(conn.set_connected(Duration::from_secs(60), &[]));
        assert!(conn.is_connected());
        assert!(conn.send_message(Message::Disconnect));
        settle().await;
        assert_eq!(endpoint.sent_to(&peer), vec![Message::Disconnect]);

        conn.set_disconnected();
        assert!(conn.is_terminated());
        assert!(!conn.set_connected(Duration::from_secs(60), &[]));
        assert!(!conn.send_message(Message::Disconnect));
    }

    #[tokio::test]
    async fn test_lease_expires_lazily() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        let (_, conn) = connection(&endpoint, None);

        conn.set_connected(Duration::from_millis(20), &[]);
        assert!(conn.lease_remaining().is_some());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!conn.is_connected());
        assert!(conn.is_terminated());
        assert_eq!(conn.lease_remaining(), None);
    }

    #[tokio::test]
    async fn test_send_failure_disconnects_and_reports() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (peer, conn) = connection(&endpoint, Some(tx));

        conn.set_connected(Duration::from_secs(60), &[]);
        endpoint.messenger_for(&peer).fail.store(true, Ordering::SeqCst);

        assert!(conn.send_message(Message::Disconnect));
        assert_eq!(rx.recv().await, Some(peer));
        assert!(!conn.is_connected());
        assert!(conn.is_terminated());
    }

    #[tokio::test]
    async fn test_no_route_fails_immediately() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        endpoint.reachable.store(false, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (peer, conn) = connection(&endpoint, Some(tx));

        conn.set_connected(Duration::from_secs(60), &[]);
        assert!(!conn.send_message(Message::Disconnect));
        assert_eq!(rx.recv().await, Some(peer));
        assert!(conn.is_terminated());
    }

    #[tokio::test]
    async fn test_closed_messenger_re_resolved() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        let (peer, conn) = connection(&endpoint, None);
        conn.set_connected(Duration::from_secs(60), &[]);

        assert!(conn.send_message(Message::Disconnect));
        assert_eq!(endpoint.resolved.load(Ordering::SeqCst), 1);
        assert!(conn.send_message(Message::Disconnect));
        assert_eq!(endpoint.resolved.load(Ordering::SeqCst), 1);

        endpoint.messenger_for(&peer).closed.store(true, Ordering::SeqCst);
        assert!(conn.send_message(Message::Disconnect));
        assert_eq!(endpoint.resolved.load(Ordering::SeqCst), 2);
        assert_eq!(conn.messages_sent(), 3);
    }

    #[tokio::test]
    async fn test_control_needs_no_lease() {
        let endpoint = RecordingEndpoint::new(PeerId::random());
        let (peer, conn) = connection(&endpoint, None);
        let request = Message::LeaseRequest {
            lease_ms: 1000,
            addresses: vec![],
            rendezvous: false,
        };
        assert!(conn.send_control(request.clone()));
        settle().await;
        assert_eq!(endpoint.sent_to(&peer), vec![request]);
    }
}
