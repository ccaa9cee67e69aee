//! Index coordinator.
//!
//! Ties the SRDI local index to the overlay:
//!
//! - inbound index messages are checked, recorded and replicated
//! - local entries are pushed to rendezvous peers by a periodic worker
//! - resolver queries are answered, routed or forwarded with a hard hop
//!   bound; queries with no replica to go to walk the rendezvous ring
//!
//! Membership events steer the push worker. A (re)connect wakes it and asks
//! for a full republish; a departure asks for a full republish on the next
//! cycle and hides the departed peer's claims.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use ember_core::{CanonicalDecode, CanonicalEncode, PeerId};
use ember_overlay::{OverlayEvent, RendezvousOverlay, Role, ServiceHandler};
use ember_proto::{ResolverQuery, ResolverResponse, SrdiEntry, SrdiMessage};
use ember_store::SrdiLocalIndex;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::CoordinatorConfig;
use crate::credential::CredentialProvider;
use crate::publisher::SrdiPublisher;
use crate::query::QueryHandler;
use crate::replica::select_replica;
use crate::{SrdiError, PUSH_TTL, RESOLVER_RESPONSE_SERVICE, RESOLVER_SERVICE, SRDI_SERVICE};

/// Coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Push cycles run
    pub pushes: u64,
    /// Push cycles that republished everything
    pub full_pushes: u64,
    /// Index messages accepted
    pub received: u64,
    /// Index messages rejected
    pub rejected: u64,
    /// Replica messages sent
    pub replicated: u64,
    /// Queries forwarded
    pub forwarded: u64,
    /// Queries dropped at the hop bound
    pub dropped_queries: u64,
    /// Inbound queries answered locally
    pub answered: u64,
}

#[derive(Default)]
struct Counters {
    pushes: AtomicU64,
    full_pushes: AtomicU64,
    received: AtomicU64,
    rejected: AtomicU64,
    replicated: AtomicU64,
    forwarded: AtomicU64,
    dropped_queries: AtomicU64,
    answered: AtomicU64,
}

/// Coordinates the distributed index for one handler name.
pub struct IndexCoordinator {
    config: CoordinatorConfig,
    overlay: Arc<RendezvousOverlay>,
    index: Arc<SrdiLocalIndex>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    publisher: RwLock<Option<Arc<dyn SrdiPublisher>>>,
    query_handler: RwLock<Option<Arc<dyn QueryHandler>>>,
    wakeup: Notify,
    republish: AtomicBool,
    counters: Counters,
}

impl IndexCoordinator {
    /// Creates the coordinator and registers it with the overlay for
    /// inbound index messages, resolver queries and resolver responses.
    pub fn new(
        config: CoordinatorConfig,
        overlay: Arc<RendezvousOverlay>,
        index: Arc<SrdiLocalIndex>,
        credentials: Option<Arc<dyn CredentialProvider>>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            config,
            overlay,
            index,
            credentials,
            publisher: RwLock::new(None),
            query_handler: RwLock::new(None),
            wakeup: Notify::new(),
            republish: AtomicBool::new(true),
            counters: Counters::default(),
        });

        coordinator.overlay.register_handler(
            SRDI_SERVICE,
            Arc::new(SrdiHandler {
                coordinator: Arc::downgrade(&coordinator),
            }),
        );
        coordinator.overlay.register_handler(
            RESOLVER_SERVICE,
            Arc::new(ResolverHandler {
                coordinator: Arc::downgrade(&coordinator),
            }),
        );
        coordinator.overlay.register_handler(
            RESOLVER_RESPONSE_SERVICE,
            Arc::new(ResponseHandler {
                coordinator: Arc::downgrade(&coordinator),
            }),
        );
        info!(handler = %coordinator.config.handler_name, "Index coordinator ready");
        coordinator
    }

    /// Handler name.
    pub fn handler_name(&self) -> &str {
        &self.config.handler_name
    }

    /// The SRDI local index fed by this coordinator.
    pub fn index(&self) -> &Arc<SrdiLocalIndex> {
        &self.index
    }

    /// Installs the callback the push worker drives.
    pub fn set_publisher(&self, publisher: Arc<dyn SrdiPublisher>) {
        *self.publisher.write() = Some(publisher);
    }

    /// Installs the service answering resolver queries.
    pub fn set_query_handler(&self, handler: Arc<dyn QueryHandler>) {
        *self.query_handler.write() = Some(handler);
    }

    /// Replica responsible for `expression` in the current view.
    pub fn get_replica_peer(&self, expression: &str) -> Option<PeerId> {
        select_replica(
            &self.replica_view(),
            expression,
            self.config.replication_threshold,
        )
    }

    /// Sends each entry to its replica, one message per distinct replica.
    /// Only a rendezvous replicates. Returns the number of messages sent.
    pub fn replicate_entries(&self, message: &SrdiMessage) -> usize {
        if !self.overlay.is_rendezvous() {
            return 0;
        }
        let view = self.replica_view();
        let local = self.overlay.local_peer();

        let mut buckets: BTreeMap<PeerId, Vec<SrdiEntry>> = BTreeMap::new();
        for entry in &message.entries {
            let expression = replica_expression(&message.primary_key, &entry.key, &entry.value);
            let Some(replica) =
                select_replica(&view, &expression, self.config.replication_threshold)
            else {
                trace!(view = view.len(), "View too small to replicate");
                return 0;
            };
            if replica != local {
                buckets.entry(replica).or_default().push(entry.clone());
            }
        }

        let mut sent = 0;
        for (replica, entries) in buckets {
            let mut copy = SrdiMessage::new(message.source_peer, &message.primary_key, 0, entries);
            if self.send_srdi(&replica, &mut copy) {
                sent += 1;
            }
        }
        self.counters
            .replicated
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Forwards `query` to at most `threshold` of `peers`, picked at random
    /// when there are more. Drops the query once its hop count passes the
    /// bound. Returns the number of peers it was sent to.
    pub fn forward_query(
        &self,
        peers: &[PeerId],
        mut query: ResolverQuery,
        threshold: usize,
    ) -> usize {
        let hops = query.increment_hop_count();
        if hops > self.config.max_hop_count {
            debug!(query_id = query.query_id, hops, "Dropping query at hop bound");
            self.counters.dropped_queries.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let local = self.overlay.local_peer();
        let candidates: Vec<PeerId> = peers.iter().filter(|p| **p != local).copied().collect();
        let targets: Vec<PeerId> = if candidates.len() > threshold {
            candidates
                .choose_multiple(&mut rand::thread_rng(), threshold)
                .copied()
                .collect()
        } else {
            candidates
        };

        let payload = query.to_bytes();
        let mut sent = 0;
        for peer in &targets {
            match self.send(peer, RESOLVER_SERVICE, &query.handler_name, payload.clone()) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %peer, error = %e, "Query forward failed"),
            }
        }
        self.counters
            .forwarded
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Routes `query` to peers known to hold `(pk, attr, value)`, falling
    /// back to the replica for the triple. Without a replica other than
    /// ourselves the query walks the rendezvous ring instead.
    pub fn route_query(
        &self,
        pk: &str,
        attr: &str,
        value: &str,
        threshold: usize,
        query: ResolverQuery,
    ) -> usize {
        let known = match self.index.query(pk, Some(attr), Some(value), threshold) {
            Ok(peers) => peers,
            Err(e) => {
                warn!(pk, attr, error = %e, "SRDI lookup failed");
                Vec::new()
            }
        };
        if !known.is_empty() {
            return self.forward_query(&known, query, threshold);
        }

        match self.get_replica_peer(&replica_expression(pk, attr, value)) {
            Some(replica) if replica != self.overlay.local_peer() => {
                self.forward_query(&[replica], query, 1)
            }
            _ => self.walk_query(query),
        }
    }

    /// Walks `query` to the ring successor of the local peer. Every
    /// rendezvous on the way sees it while hops remain. Returns 1 if the
    /// walk was started.
    pub fn walk_query(&self, mut query: ResolverQuery) -> usize {
        let hops = query.increment_hop_count();
        if hops > self.config.max_hop_count {
            debug!(query_id = query.query_id, hops, "Dropping query at hop bound");
            self.counters.dropped_queries.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let Some(next) = self.overlay.view().next_in_ring(|p| *p == query.src_peer) else {
            trace!(query_id = query.query_id, "No ring successor to walk to");
            return 0;
        };

        let ttl = i32::try_from(self.config.max_hop_count - hops + 1).unwrap_or(i32::MAX);
        let message_id = self.overlay.walk(
            &[next],
            RESOLVER_SERVICE,
            &query.handler_name,
            query.to_bytes(),
            Some(ttl),
        );
        trace!(query_id = query.query_id, message = %message_id, peer = %next, ttl, "Walking query");
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        1
    }

    /// Processes an inbound resolver query. The query handler answers it
    /// when it can, sending the response to the originator. Otherwise the
    /// query is routed by its triple or passed on across the view, never
    /// back to `from` or its originator. Returns the number of peers the
    /// query went on to.
    pub fn handle_query(&self, from: PeerId, payload: &[u8]) -> Result<usize, SrdiError> {
        let query = ResolverQuery::from_bytes(payload)?;
        let handler = self.query_handler.read().clone();

        if let Some(handler) = &handler {
            if let Some(answer) = handler.process_query(&query) {
                let response = ResolverResponse::for_query(&query, answer);
                self.send(
                    &query.src_peer,
                    RESOLVER_RESPONSE_SERVICE,
                    &query.handler_name,
                    response.to_bytes(),
                )?;
                self.counters.answered.fetch_add(1, Ordering::Relaxed);
                return Ok(0);
            }
            if let Some((pk, attr, value)) = handler.route_key(&query) {
                return Ok(self.route_query(
                    &pk,
                    &attr,
                    &value,
                    self.config.forward_threshold,
                    query,
                ));
            }
        }

        let peers: Vec<PeerId> = self
            .overlay
            .view()
            .ordered(false)
            .into_iter()
            .filter(|p| *p != from && *p != query.src_peer)
            .collect();
        Ok(self.forward_query(&peers, query, self.config.forward_threshold))
    }

    /// Hands an inbound resolver response to the query handler.
    pub fn handle_response(&self, from: PeerId, payload: &[u8]) -> Result<(), SrdiError> {
        let response = ResolverResponse::from_bytes(payload)?;
        let handler = self.query_handler.read().clone();
        match handler {
            Some(handler) => handler.process_response(from, response),
            None => trace!(peer = %from, query_id = response.query_id, "No handler for response"),
        }
        Ok(())
    }

    /// Publishes local entries under `pk`.
    ///
    /// An edge sends them to each connected rendezvous. A rendezvous records
    /// them itself and replicates. Returns the number of messages sent.
    pub fn push_srdi(&self, pk: &str, entries: Vec<SrdiEntry>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let local = self.overlay.local_peer();

        if self.overlay.is_rendezvous() {
            for entry in &entries {
                if let Err(e) =
                    self.index
                        .add(pk, &entry.key, &entry.value, local, entry.expiration())
                {
                    warn!(pk, key = %entry.key, error = %e, "Failed to record local entry");
                }
            }
            return self.replicate_entries(&SrdiMessage::new(local, pk, 0, entries));
        }

        let mut message = SrdiMessage::new(local, pk, PUSH_TTL, entries);
        self.overlay
            .connected_rendezvous()
            .iter()
            .filter(|peer| self.send_srdi(peer, &mut message))
            .count()
    }

    /// Processes an inbound index message. Returns the number of entries
    /// recorded.
    pub fn handle_srdi(&self, payload: &[u8]) -> Result<usize, SrdiError> {
        let message = SrdiMessage::from_bytes(payload)?;
        if let Some(credentials) = &self.credentials {
            credentials.verify(&message)?;
        }

        for entry in &message.entries {
            self.index.add(
                &message.primary_key,
                &entry.key,
                &entry.value,
                message.source_peer,
                entry.expiration(),
            )?;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if message.ttl > 0 && self.overlay.is_rendezvous() {
            self.replicate_entries(&message);
        }
        Ok(message.entries.len())
    }

    /// Reacts to an overlay membership event.
    pub fn on_membership_event(&self, event: &OverlayEvent) {
        if event.is_connect() {
            self.republish.store(true, Ordering::Release);
            self.wakeup.notify_one();
        } else if event.is_departure() {
            self.republish.store(true, Ordering::Release);
            if let Some(peer) = event.peer() {
                self.index.remove(&peer);
            }
        } else if matches!(event, OverlayEvent::BecameRendezvous | OverlayEvent::BecameEdge) {
            self.republish.store(true, Ordering::Release);
        }
    }

    /// Runs one push cycle. Returns false while waiting for membership.
    pub fn run_push(&self) -> bool {
        if self.awaiting_membership() {
            return false;
        }
        let Some(publisher) = self.publisher.read().clone() else {
            return false;
        };

        let all = self.republish.swap(false, Ordering::AcqRel);
        self.counters.pushes.fetch_add(1, Ordering::Relaxed);
        if all {
            self.counters.full_pushes.fetch_add(1, Ordering::Relaxed);
        }
        publisher.push_entries(all);
        true
    }

    /// Starts the push worker and the membership listener.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut events = self.overlay.subscribe();
        let coordinator = Arc::clone(self);
        let token = cancel.clone();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => coordinator.on_membership_event(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Missed membership events, republishing");
                            coordinator.republish.store(true, Ordering::Release);
                            coordinator.wakeup.notify_one();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let coordinator = Arc::clone(self);
        let worker = tokio::spawn(async move {
            loop {
                let wait = if coordinator.awaiting_membership() {
                    coordinator.config.membership_wait_interval
                } else {
                    coordinator.config.push_interval
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                    _ = coordinator.wakeup.notified() => {}
                }
                coordinator.run_push();
            }
            debug!(handler = %coordinator.config.handler_name, "Push worker stopped");
        });

        vec![listener, worker]
    }

    /// Returns coordinator counters.
    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        CoordinatorStats {
            pushes: c.pushes.load(Ordering::Relaxed),
            full_pushes: c.full_pushes.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            replicated: c.replicated.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            dropped_queries: c.dropped_queries.load(Ordering::Relaxed),
            answered: c.answered.load(Ordering::Relaxed),
        }
    }

    /// An edge without rendezvous connections has nobody to push to.
    fn awaiting_membership(&self) -> bool {
        self.overlay.role() == Role::Edge && self.overlay.connected_rendezvous().is_empty()
    }

    fn replica_view(&self) -> Vec<PeerId> {
        self.overlay.view().ordered(self.overlay.is_rendezvous())
    }

    fn send_srdi(&self, peer: &PeerId, message: &mut SrdiMessage) -> bool {
        if let Some(credentials) = &self.credentials {
            credentials.sign(message);
        }
        let payload = message.to_bytes();
        match self.send(peer, SRDI_SERVICE, &self.config.handler_name, payload) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer, error = %e, "SRDI send failed");
                false
            }
        }
    }

    fn send(
        &self,
        peer: &PeerId,
        service: &str,
        param: &str,
        payload: Bytes,
    ) -> Result<(), SrdiError> {
        Ok(self.overlay.send_direct(peer, service, param, payload)?)
    }
}

/// Replica key for one entry.
fn replica_expression(pk: &str, attr: &str, value: &str) -> String {
    format!("{pk}{attr}{value}")
}

/// Overlay service handler feeding inbound index messages to the
/// coordinator.
struct SrdiHandler {
    coordinator: Weak<IndexCoordinator>,
}

impl ServiceHandler for SrdiHandler {
    fn on_message(&self, from: PeerId, param: &str, payload: Bytes) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        if param != coordinator.config.handler_name {
            trace!(peer = %from, param, "Index message for another handler");
            return;
        }
        if let Err(e) = coordinator.handle_srdi(&payload) {
            coordinator.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %from, error = %e, "Rejected index message");
        }
    }
}

/// Overlay service handler for forwarded and walked resolver queries.
struct ResolverHandler {
    coordinator: Weak<IndexCoordinator>,
}

impl ServiceHandler for ResolverHandler {
    fn on_message(&self, from: PeerId, param: &str, payload: Bytes) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        if param != coordinator.config.handler_name {
            trace!(peer = %from, param, "Query for another handler");
            return;
        }
        match coordinator.handle_query(from, &payload) {
            Ok(sent) => trace!(peer = %from, sent, "Handled resolver query"),
            Err(e) => debug!(peer = %from, error = %e, "Failed to handle resolver query"),
        }
    }
}

/// Overlay service handler for responses to our own queries.
struct ResponseHandler {
    coordinator: Weak<IndexCoordinator>,
}

impl ServiceHandler for ResponseHandler {
    fn on_message(&self, from: PeerId, param: &str, payload: Bytes) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };
        if param != coordinator.config.handler_name {
            return;
        }
        if let Err(e) = coordinator.handle_response(from, &payload) {
            debug!(peer = %from, error = %e, "Dropped resolver response");
        }
    }
}
