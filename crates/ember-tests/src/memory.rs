//! In-memory transport connecting overlays inside one process.
//!
//! Every message is framed, encoded and decoded on its way, so whatever
//! reaches a peer has been through the same codec as on a socket.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ember_core::{CanonicalDecode, CanonicalEncode, PeerId};
use ember_overlay::{Endpoint, Messenger, RendezvousOverlay, TransportError};
use ember_proto::{Frame, Message};
use parking_lot::RwLock;
use tracing::trace;

struct Attached {
    overlay: Weak<RendezvousOverlay>,
    subnet: Option<u32>,
}

/// Switchboard shared by every [`MemoryEndpoint`] of a test network.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<PeerId, Attached>>,
    unreachable: RwLock<HashSet<PeerId>>,
    frames: AtomicU64,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the endpoint for `local`.
    pub fn endpoint(self: &Arc<Self>, local: PeerId) -> Arc<MemoryEndpoint> {
        Arc::new(MemoryEndpoint {
            local,
            network: Arc::clone(self),
        })
    }

    /// Makes `overlay` reachable. Peers sharing a `subnet` hear each
    /// other's broadcasts.
    pub fn attach(&self, overlay: &Arc<RendezvousOverlay>, subnet: Option<u32>) {
        self.peers.write().insert(
            overlay.local_peer(),
            Attached {
                overlay: Arc::downgrade(overlay),
                subnet,
            },
        );
    }

    /// Cuts a peer off (or reconnects it) without detaching it.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(peer);
        } else {
            unreachable.insert(*peer);
        }
    }

    /// Returns true if `peer` is attached and not cut off.
    pub fn is_reachable(&self, peer: &PeerId) -> bool {
        !self.unreachable.read().contains(peer) && self.peers.read().contains_key(peer)
    }

    /// Frames delivered so far.
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: PeerId, to: &PeerId, message: Message) -> Result<(), TransportError> {
        if !self.is_reachable(&from) || !self.is_reachable(to) {
            return Err(TransportError::Unreachable(*to));
        }
        let overlay = self
            .peers
            .read()
            .get(to)
            .and_then(|a| a.overlay.upgrade())
            .ok_or(TransportError::Unreachable(*to))?;

        let wire = Frame::new(from, message).to_bytes();
        let frame =
            Frame::from_bytes(&wire).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.frames.fetch_add(1, Ordering::Relaxed);
        trace!(from = %from, to = %to, bytes = wire.len(), "Delivering frame");

        overlay.handle_message(frame.sender, frame.message);
        Ok(())
    }

    fn subnet_peers(&self, local: &PeerId) -> Vec<PeerId> {
        let peers = self.peers.read();
        let Some(subnet) = peers.get(local).and_then(|a| a.subnet) else {
            return Vec::new();
        };
        peers
            .iter()
            .filter(|(peer, a)| *peer != local && a.subnet == Some(subnet))
            .map(|(peer, _)| *peer)
            .collect()
    }
}

/// Endpoint of one peer on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn local_addresses(&self) -> Vec<String> {
        vec![format!("mem://{}", self.local)]
    }

    fn messenger(&self, peer: &PeerId, _hints: &[String]) -> Option<Arc<dyn Messenger>> {
        if !self.network.is_reachable(peer) {
            return None;
        }
        Some(Arc::new(MemoryMessenger {
            from: self.local,
            to: *peer,
            network: Arc::clone(&self.network),
        }))
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        for peer in self.network.subnet_peers(&self.local) {
            if let Err(e) = self.network.deliver(self.local, &peer, message.clone()) {
                trace!(peer = %peer, error = %e, "Broadcast copy dropped");
            }
        }
        Ok(())
    }
}

struct MemoryMessenger {
    from: PeerId,
    to: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Messenger for MemoryMessenger {
    fn is_closed(&self) -> bool {
        !self.network.is_reachable(&self.to)
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.network.deliver(self.from, &self.to, message)
    }
}
