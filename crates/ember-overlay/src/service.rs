//! Rendezvous overlay service.
//!
//! Owns the local peer's connections in both directions:
//!
//! - **rendezvous connections**: leases this peer holds from rendezvous peers
//! - **client connections**: leases this peer granted while acting as a
//!   rendezvous
//!
//! Inbound messages arrive through [`RendezvousOverlay::handle_message`].
//! Propagated and walked messages are checked against the header rules,
//! delivered to the registered [`ServiceHandler`] and, when the local role
//! allows it, sent on with an updated header.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_core::{MessageId, PeerId};
use ember_proto::{Envelope, Message, PropagateHeader};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{OverlayConfig, Role};
use crate::connection::PeerConnection;
use crate::dedup::DuplicateFilter;
use crate::endpoint::{Endpoint, ServiceHandler};
use crate::events::OverlayEvent;
use crate::propagation::{check_incoming, update_header, DropReason};
use crate::view::PeerView;
use crate::{OverlayError, DEFAULT_EVENT_CHANNEL_SIZE};

/// Overlay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayStats {
    /// Payloads handed to local services
    pub delivered: u64,
    /// Messages queued to peers
    pub sent: u64,
    /// Envelopes without a header
    pub missing_header: u64,
    /// Envelopes with an unparsable header
    pub malformed_header: u64,
    /// Messages arriving with no TTL left
    pub ttl_expired: u64,
    /// Messages already seen
    pub duplicates: u64,
    /// Messages that had already visited this peer
    pub loops: u64,
    /// Payloads for services nobody registered
    pub unknown_service: u64,
    /// Failed sends
    pub send_failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    sent: AtomicU64,
    missing_header: AtomicU64,
    malformed_header: AtomicU64,
    ttl_expired: AtomicU64,
    duplicates: AtomicU64,
    loops: AtomicU64,
    unknown_service: AtomicU64,
    send_failures: AtomicU64,
}

impl Counters {
    fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::MissingHeader => &self.missing_header,
            DropReason::MalformedHeader => &self.malformed_header,
            DropReason::TtlExpired => &self.ttl_expired,
            DropReason::Duplicate => &self.duplicates,
            DropReason::Loop => &self.loops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> OverlayStats {
        OverlayStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            missing_header: self.missing_header.load(Ordering::Relaxed),
            malformed_header: self.malformed_header.load(Ordering::Relaxed),
            ttl_expired: self.ttl_expired.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            loops: self.loops.load(Ordering::Relaxed),
            unknown_service: self.unknown_service.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Watchdog decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleAction {
    Promote,
    Demote,
}

/// Resets the in-flight switch flag when dropped.
struct SwitchGuard<'a>(&'a AtomicBool);

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type ConnectionMap = RwLock<HashMap<PeerId, Arc<PeerConnection>>>;

/// The rendezvous overlay.
pub struct RendezvousOverlay {
    config: OverlayConfig,
    local: PeerId,
    endpoint: Arc<dyn Endpoint>,
    role: RwLock<Role>,
    switching: AtomicBool,
    rendezvous: ConnectionMap,
    clients: ConnectionMap,
    view: PeerView,
    seen: Mutex<DuplicateFilter>,
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
    events: broadcast::Sender<OverlayEvent>,
    failures_tx: mpsc::UnboundedSender<PeerId>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
    counters: Counters,
}

impl RendezvousOverlay {
    /// Creates the overlay in the configured initial role.
    pub fn new(config: OverlayConfig, endpoint: Arc<dyn Endpoint>) -> Arc<Self> {
        let local = endpoint.local_peer();
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_SIZE);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        info!(peer = %local, role = config.initial_role.name(), "Starting rendezvous overlay");

        Arc::new(Self {
            role: RwLock::new(config.initial_role),
            seen: Mutex::new(DuplicateFilter::new(config.seen_capacity)),
            config,
            local,
            endpoint,
            switching: AtomicBool::new(false),
            rendezvous: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            view: PeerView::new(local),
            handlers: RwLock::new(HashMap::new()),
            events,
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            counters: Counters::default(),
        })
    }

    /// Local peer ID.
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    /// Overlay configuration.
    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.role.read()
    }

    /// Returns true while acting as a rendezvous.
    pub fn is_rendezvous(&self) -> bool {
        self.role() == Role::Rendezvous
    }

    /// Membership view of rendezvous peers.
    pub fn view(&self) -> &PeerView {
        &self.view
    }

    /// Subscribes to membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    /// Registers the handler for a service name, replacing any previous one.
    pub fn register_handler(&self, service: &str, handler: Arc<dyn ServiceHandler>) {
        self.handlers.write().insert(service.to_string(), handler);
        debug!(service, "Registered service handler");
    }

    /// Removes a service handler.
    pub fn unregister_handler(&self, service: &str) -> bool {
        self.handlers.write().remove(service).is_some()
    }

    /// Adds a known rendezvous peer to the view without connecting.
    pub fn add_seed(&self, peer: PeerId, addresses: &[String]) {
        if self.view.add(peer, addresses) {
            debug!(peer = %peer, "Added seed rendezvous");
        }
    }

    /// Requests a lease from a rendezvous peer.
    pub fn connect(&self, peer: PeerId, addresses: &[String]) -> Result<(), OverlayError> {
        if self.role() == Role::AdHoc {
            return Err(OverlayError::InvalidRole(Role::AdHoc));
        }
        if peer == self.local {
            return Ok(());
        }

        let conn = {
            let mut map = self.rendezvous.write();
            match map.get(&peer) {
                Some(conn) if !conn.is_terminated() => Arc::clone(conn),
                _ => {
                    let conn = self.new_connection(peer, addresses.to_vec());
                    map.insert(peer, Arc::clone(&conn));
                    conn
                }
            }
        };

        if conn.send_control(self.lease_request()) {
            debug!(peer = %peer, "Requested lease");
            Ok(())
        } else {
            Err(OverlayError::NoRoute(peer))
        }
    }

    /// Closes every connection with `peer`.
    pub fn disconnect(&self, peer: &PeerId) {
        let client = self.clients.write().remove(peer);
        let rendezvous = self.rendezvous.write().remove(peer);

        for (conn, event) in [
            (client, OverlayEvent::ClientDisconnect(*peer)),
            (rendezvous, OverlayEvent::RendezvousDisconnect(*peer)),
        ] {
            if let Some(conn) = conn {
                conn.send_message(Message::Disconnect);
                conn.set_disconnected();
                self.emit(event);
            }
        }
        self.view.remove(peer);
    }

    /// Rendezvous peers currently leasing to us.
    pub fn connected_rendezvous(&self) -> Vec<PeerId> {
        connected_peers(&self.rendezvous)
    }

    /// Clients currently holding a lease from us.
    pub fn connected_clients(&self) -> Vec<PeerId> {
        connected_peers(&self.clients)
    }

    /// Floods a payload to every connected peer and the local subnet.
    /// Uses the configured default TTL when `ttl` is `None`.
    pub fn propagate(
        &self,
        service: &str,
        param: &str,
        payload: Bytes,
        ttl: Option<i32>,
    ) -> MessageId {
        let header = self.originate(service, param, ttl);
        self.flood(&header, payload);
        header.message_id
    }

    /// Sends a payload hop by hop to specific peers. Each rendezvous on the
    /// way continues the walk along its view while TTL remains.
    pub fn walk(
        &self,
        targets: &[PeerId],
        service: &str,
        param: &str,
        payload: Bytes,
        ttl: Option<i32>,
    ) -> MessageId {
        let header = self.originate(service, param, ttl);
        let message = Message::Walk(Envelope::new(&header, payload));
        for target in targets {
            if *target != self.local && !self.send_to(target, message.clone()) {
                debug!(peer = %target, "No route for walk target");
            }
        }
        header.message_id
    }

    /// Sends a payload straight to one peer's service.
    pub fn send_direct(
        &self,
        peer: &PeerId,
        service: &str,
        param: &str,
        payload: Bytes,
    ) -> Result<(), OverlayError> {
        if *peer == self.local {
            self.deliver(self.local, service, param, payload);
            return Ok(());
        }
        let message = Message::Direct {
            service: service.to_string(),
            param: param.to_string(),
            payload,
        };
        if self.send_to(peer, message) {
            Ok(())
        } else {
            Err(OverlayError::NoRoute(*peer))
        }
    }

    /// Entry point for every inbound message.
    pub fn handle_message(&self, from: PeerId, message: Message) {
        match message {
            Message::LeaseRequest {
                lease_ms,
                addresses,
                rendezvous,
            } => self.handle_lease_request(from, lease_ms, addresses, rendezvous),
            Message::LeaseGranted {
                lease_ms,
                addresses,
                view,
            } => self.handle_lease_granted(from, lease_ms, addresses, view),
            Message::Disconnect => self.handle_disconnect(from),
            Message::Propagate(envelope) => self.handle_envelope(from, envelope, false),
            Message::Walk(envelope) => self.handle_envelope(from, envelope, true),
            Message::Direct {
                service,
                param,
                payload,
            } => self.deliver(from, &service, &param, payload),
        }
    }

    /// Switches from edge to rendezvous.
    pub fn start_rendezvous(&self) -> Result<(), OverlayError> {
        let _guard = self.begin_switch()?;
        {
            let mut role = self.role.write();
            match *role {
                Role::Rendezvous => return Ok(()),
                Role::AdHoc => return Err(OverlayError::InvalidRole(Role::AdHoc)),
                Role::Edge => *role = Role::Rendezvous,
            }
        }
        info!(peer = %self.local, "Now acting as rendezvous");
        self.emit(OverlayEvent::BecameRendezvous);
        Ok(())
    }

    /// Switches from rendezvous to edge, releasing every client.
    pub fn stop_rendezvous(&self) -> Result<(), OverlayError> {
        let _guard = self.begin_switch()?;
        {
            let mut role = self.role.write();
            match *role {
                Role::Edge => return Ok(()),
                Role::AdHoc => return Err(OverlayError::InvalidRole(Role::AdHoc)),
                Role::Rendezvous => *role = Role::Edge,
            }
        }

        let clients: Vec<Arc<PeerConnection>> =
            self.clients.write().drain().map(|(_, c)| c).collect();
        for conn in clients {
            conn.send_message(Message::Disconnect);
            conn.set_disconnected();
            self.emit(OverlayEvent::ClientDisconnect(*conn.peer_id()));
        }

        info!(peer = %self.local, "Now acting as edge");
        self.emit(OverlayEvent::BecameEdge);
        Ok(())
    }

    /// Runs one watchdog evaluation. Returns the new role if it changed.
    pub fn run_watchdog(&self) -> Option<Role> {
        if !self.config.auto_rendezvous {
            return None;
        }
        let action = self.evaluate_role(&mut rand::thread_rng())?;
        let result = match action {
            RoleAction::Promote => self.start_rendezvous(),
            RoleAction::Demote => self.stop_rendezvous(),
        };
        match result {
            Ok(()) => Some(self.role()),
            Err(e) => {
                debug!(error = %e, "Watchdog switch skipped");
                None
            }
        }
    }

    /// Drops lapsed client leases and renews rendezvous leases past half
    /// their duration. Pending lease requests are retried.
    pub fn maintain_leases(&self) {
        let lapsed: Vec<PeerId> = {
            let mut clients = self.clients.write();
            let lapsed: Vec<PeerId> = clients
                .iter()
                .filter(|(_, c)| c.is_terminated())
                .map(|(p, _)| *p)
                .collect();
            for peer in &lapsed {
                clients.remove(peer);
            }
            lapsed
        };
        for peer in lapsed {
            debug!(peer = %peer, "Client lease lapsed");
            if !self.has_live_rendezvous(&peer) {
                self.view.remove(&peer);
            }
            self.emit(OverlayEvent::ClientDisconnect(peer));
        }

        let conns: Vec<Arc<PeerConnection>> = self.rendezvous.read().values().cloned().collect();
        for conn in conns {
            let peer = *conn.peer_id();
            if conn.is_terminated() {
                self.rendezvous.write().remove(&peer);
                self.view.remove(&peer);
                debug!(peer = %peer, "Rendezvous lease lapsed");
                self.emit(OverlayEvent::RendezvousDisconnect(peer));
                continue;
            }
            let renew = match conn.lease_remaining() {
                Some(remaining) => remaining < conn.lease() / 2,
                None => true,
            };
            if renew {
                trace!(peer = %peer, "Renewing lease");
                conn.send_control(self.lease_request());
            }
        }
    }

    /// Handles a failed send to `peer`.
    pub fn process_failure(&self, peer: &PeerId) {
        self.counters.send_failures.fetch_add(1, Ordering::Relaxed);

        if remove_terminated(&self.clients, peer) {
            self.emit(OverlayEvent::ClientFailed(*peer));
        }
        if remove_terminated(&self.rendezvous, peer) {
            self.emit(OverlayEvent::RendezvousFailed(*peer));
        }
        if !self.has_live_rendezvous(peer) && !self.has_live_client(peer) {
            self.view.remove(peer);
        }
    }

    /// Starts the failure listener, lease maintenance and (with
    /// auto-rendezvous) the role watchdog.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(mut failures) = self.failures_rx.lock().take() {
            let overlay = Arc::clone(self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        peer = failures.recv() => match peer {
                            Some(peer) => overlay.process_failure(&peer),
                            None => break,
                        },
                    }
                }
            }));
        }

        handles.push(self.spawn_periodic(
            "leases",
            self.config.lease_check_interval,
            cancel.clone(),
            |overlay| overlay.maintain_leases(),
        ));

        if self.config.auto_rendezvous {
            handles.push(self.spawn_periodic(
                "watchdog",
                self.config.watchdog_interval,
                cancel,
                |overlay| {
                    overlay.run_watchdog();
                },
            ));
        }

        handles
    }

    /// Tells every connected peer goodbye and forgets all connections.
    pub fn shutdown(&self) {
        let conns: Vec<Arc<PeerConnection>> = self
            .clients
            .write()
            .drain()
            .chain(self.rendezvous.write().drain())
            .map(|(_, c)| c)
            .collect();
        for conn in conns {
            conn.send_message(Message::Disconnect);
            conn.set_disconnected();
        }
        info!(peer = %self.local, "Overlay shut down");
    }

    /// Returns overlay counters.
    pub fn stats(&self) -> OverlayStats {
        self.counters.snapshot()
    }

    fn spawn_periodic<F>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        task: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&RendezvousOverlay) + Send + 'static,
    {
        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => task(&overlay),
                }
            }
            debug!(worker = name, "Overlay worker stopped");
        })
    }

    fn handle_lease_request(
        &self,
        from: PeerId,
        lease_ms: u64,
        addresses: Vec<String>,
        rendezvous: bool,
    ) {
        if !self.is_rendezvous() {
            debug!(peer = %from, "Ignoring lease request, not a rendezvous");
            return;
        }

        let requested = Duration::from_millis(lease_ms);
        let lease = if requested.is_zero() {
            self.config.lease_duration
        } else {
            requested.min(self.config.lease_duration)
        };

        let (conn, event) = {
            let mut clients = self.clients.write();
            let existing = clients.get(&from).cloned();
            match existing {
                Some(conn) if conn.set_connected(lease, &addresses) => {
                    (conn, OverlayEvent::ClientReconnect(from))
                }
                _ => {
                    let conn = self.new_connection(from, addresses.clone());
                    conn.set_connected(lease, &addresses);
                    clients.insert(from, Arc::clone(&conn));
                    (conn, OverlayEvent::ClientConnect(from))
                }
            }
        };

        if rendezvous {
            self.view.add(from, &addresses);
        }

        conn.send_message(Message::LeaseGranted {
            lease_ms: u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
            addresses: self.endpoint.local_addresses(),
            view: self.view.peers(),
        });
        debug!(peer = %from, lease_ms = lease.as_millis() as u64, "Granted lease");
        self.emit(event);
    }

    fn handle_lease_granted(
        &self,
        from: PeerId,
        lease_ms: u64,
        addresses: Vec<String>,
        view: Vec<PeerId>,
    ) {
        let Some(conn) = self.rendezvous.read().get(&from).cloned() else {
            debug!(peer = %from, "Ignoring unsolicited lease");
            return;
        };

        let lease = Duration::from_millis(lease_ms);
        let renewal = conn.is_connected();
        let event = if conn.set_connected(lease, &addresses) {
            if renewal {
                OverlayEvent::RendezvousReconnect(from)
            } else {
                OverlayEvent::RendezvousConnect(from)
            }
        } else {
            let fresh = self.new_connection(from, addresses.clone());
            fresh.set_connected(lease, &addresses);
            self.rendezvous.write().insert(from, fresh);
            OverlayEvent::RendezvousConnect(from)
        };

        self.view.add(from, &addresses);
        for peer in view {
            self.view.add(peer, &[]);
        }
        debug!(peer = %from, lease_ms, "Lease granted");
        self.emit(event);
    }

    fn handle_disconnect(&self, from: PeerId) {
        let client = self.clients.write().remove(&from);
        if let Some(conn) = client {
            conn.set_disconnected();
            self.emit(OverlayEvent::ClientDisconnect(from));
        }
        let rendezvous = self.rendezvous.write().remove(&from);
        if let Some(conn) = rendezvous {
            conn.set_disconnected();
            self.emit(OverlayEvent::RendezvousDisconnect(from));
        }
        self.view.remove(&from);
    }

    fn handle_envelope(&self, from: PeerId, envelope: Envelope, walk: bool) {
        let checked = {
            let mut seen = self.seen.lock();
            check_incoming(&envelope, &self.local, &mut seen)
        };
        let header = match checked {
            Ok(header) => header,
            Err(reason) => {
                trace!(peer = %from, ?reason, "Dropped propagated message");
                self.counters.record_drop(reason);
                return;
            }
        };

        self.deliver(
            from,
            &header.service_name,
            &header.service_param,
            envelope.payload.clone(),
        );

        let role = self.role();
        if role == Role::Edge {
            return;
        }
        let Some(next) = update_header(header, &self.local, self.config.max_ttl) else {
            return;
        };

        if !walk {
            self.flood(&next, envelope.payload);
            return;
        }
        if role != Role::Rendezvous {
            return;
        }
        match self.view.next_in_ring(|p| next.is_visited(p)) {
            Some(target) => {
                self.send_to(&target, Message::Walk(envelope.with_header(&next)));
            }
            None => trace!(message = %next.message_id, "Walk reached the end of the view"),
        }
    }

    fn deliver(&self, from: PeerId, service: &str, param: &str, payload: Bytes) {
        let handler = self.handlers.read().get(service).cloned();
        match handler {
            Some(handler) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                handler.on_message(from, param, payload);
            }
            None => {
                self.counters.unknown_service.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %from, service, "No handler for service");
            }
        }
    }

    fn originate(&self, service: &str, param: &str, ttl: Option<i32>) -> PropagateHeader {
        let ttl = ttl
            .unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl);
        let mut header = PropagateHeader::new(service, param, ttl);
        header.add_visited(self.local);
        self.seen.lock().insert(header.message_id);
        header
    }

    fn flood(&self, header: &PropagateHeader, payload: Bytes) {
        let message = Message::Propagate(Envelope::new(header, payload));

        if self.role() != Role::AdHoc {
            for conn in self.live_connections() {
                if header.is_visited(conn.peer_id()) {
                    continue;
                }
                if conn.send_message(message.clone()) {
                    self.counters.sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let endpoint = Arc::clone(&self.endpoint);
        tokio::spawn(async move {
            if let Err(e) = endpoint.broadcast(message).await {
                debug!(error = %e, "Local broadcast failed");
            }
        });
    }

    /// Sends over a live connection, or straight through the endpoint using
    /// the view's route hints.
    fn send_to(&self, peer: &PeerId, message: Message) -> bool {
        if let Some(conn) = self.live_connection(peer) {
            if conn.send_message(message.clone()) {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        let hints = self.view.hints(peer);
        let Some(messenger) = self.endpoint.messenger(peer, &hints) else {
            return false;
        };
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        let failures = self.failures_tx.clone();
        let peer = *peer;
        tokio::spawn(async move {
            if let Err(e) = messenger.send(message).await {
                warn!(peer = %peer, error = %e, "Send failed");
                let _ = failures.send(peer);
            }
        });
        true
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        [&self.rendezvous, &self.clients]
            .into_iter()
            .filter_map(|map| map.read().get(peer).cloned())
            .find(|c| c.is_connected())
    }

    /// One live connection per remote peer.
    fn live_connections(&self) -> Vec<Arc<PeerConnection>> {
        let mut conns: HashMap<PeerId, Arc<PeerConnection>> = HashMap::new();
        for map in [&self.clients, &self.rendezvous] {
            for (peer, conn) in map.read().iter() {
                if conn.is_connected() {
                    conns.insert(*peer, Arc::clone(conn));
                }
            }
        }
        conns.into_values().collect()
    }

    fn has_live_rendezvous(&self, peer: &PeerId) -> bool {
        self.rendezvous
            .read()
            .get(peer)
            .map_or(false, |c| c.is_connected())
    }

    fn has_live_client(&self, peer: &PeerId) -> bool {
        self.clients
            .read()
            .get(peer)
            .map_or(false, |c| c.is_connected())
    }

    fn new_connection(&self, peer: PeerId, addresses: Vec<String>) -> Arc<PeerConnection> {
        Arc::new(PeerConnection::new(
            peer,
            Arc::clone(&self.endpoint),
            addresses,
            Some(self.failures_tx.clone()),
        ))
    }

    fn lease_request(&self) -> Message {
        Message::LeaseRequest {
            lease_ms: u64::try_from(self.config.lease_duration.as_millis()).unwrap_or(u64::MAX),
            addresses: self.endpoint.local_addresses(),
            rendezvous: self.is_rendezvous(),
        }
    }

    fn begin_switch(&self) -> Result<SwitchGuard<'_>, OverlayError> {
        self.switching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| OverlayError::SwitchInProgress)?;
        Ok(SwitchGuard(&self.switching))
    }

    fn evaluate_role<R: Rng>(&self, rng: &mut R) -> Option<RoleAction> {
        match self.role() {
            Role::Edge => self
                .connected_rendezvous()
                .is_empty()
                .then_some(RoleAction::Promote),
            Role::Rendezvous => {
                if self.view.len() <= self.config.demote_view_size {
                    return None;
                }
                let clients = self.connected_clients().len();
                if clients == 0 {
                    return Some(RoleAction::Demote);
                }
                let probability = self.config.demote_probability.clamp(0.0, 1.0);
                if clients < self.config.low_client_count && rng.gen_bool(probability) {
                    return Some(RoleAction::Demote);
                }
                None
            }
            Role::AdHoc => None,
        }
    }

    fn emit(&self, event: OverlayEvent) {
        debug!(?event, "Overlay event");
        let _ = self.events.send(event);
    }
}

fn connected_peers(map: &ConnectionMap) -> Vec<PeerId> {
    map.read()
        .iter()
        .filter(|(_, c)| c.is_connected())
        .map(|(p, _)| *p)
        .collect()
}

fn remove_terminated(map: &ConnectionMap, peer: &PeerId) -> bool {
    let mut map = map.write();
    if map.get(peer).map_or(false, |c| c.is_terminated()) {
        map.remove(peer);
        true
    } else {
        false
    }
}
