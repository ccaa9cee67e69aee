//! UDP endpoint carrying framed overlay messages.
//!
//! Every datagram holds one [`Frame`]. Routes are learned from the source
//! address of inbound frames and from `udp://host:port` address hints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ember_core::{CanonicalDecode, CanonicalEncode, PeerId};
use ember_overlay::{Endpoint, Messenger, RendezvousOverlay, TransportError};
use ember_proto::{Frame, Message};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Address scheme of UDP endpoint addresses.
pub const UDP_SCHEME: &str = "udp://";

/// Largest datagram sent or accepted.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Parses `udp://host:port` (or a bare `host:port`).
pub fn parse_address(address: &str) -> Option<SocketAddr> {
    address
        .strip_prefix(UDP_SCHEME)
        .unwrap_or(address)
        .parse()
        .ok()
}

fn encode_frame(sender: PeerId, message: Message) -> Result<Vec<u8>, TransportError> {
    let wire = Frame::new(sender, message).to_vec();
    if wire.len() > MAX_DATAGRAM_SIZE {
        return Err(TransportError::SendFailed(format!(
            "frame of {} bytes exceeds datagram size",
            wire.len()
        )));
    }
    Ok(wire)
}

/// Endpoint bound to one UDP socket.
pub struct UdpEndpoint {
    local: PeerId,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    broadcast_addr: Option<SocketAddr>,
    routes: RwLock<HashMap<PeerId, SocketAddr>>,
}

impl UdpEndpoint {
    /// Binds the endpoint. With a `broadcast_addr`, subnet broadcasts are
    /// sent there.
    pub async fn bind(
        local: PeerId,
        listen: SocketAddr,
        broadcast_addr: Option<SocketAddr>,
    ) -> Result<Arc<Self>, TransportError> {
        let socket = UdpSocket::bind(listen).await?;
        if broadcast_addr.is_some() {
            socket.set_broadcast(true)?;
        }
        let local_addr = socket.local_addr()?;
        debug!(peer = %local, addr = %local_addr, "Bound UDP endpoint");

        Ok(Arc::new(Self {
            local,
            socket: Arc::new(socket),
            local_addr,
            broadcast_addr,
            routes: RwLock::new(HashMap::new()),
        }))
    }

    /// Returns the bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Records where `peer` can be reached.
    pub fn learn_route(&self, peer: PeerId, addr: SocketAddr) {
        if peer == self.local {
            return;
        }
        let previous = self.routes.write().insert(peer, addr);
        if previous != Some(addr) {
            trace!(peer = %peer, addr = %addr, "Learned route");
        }
    }

    /// Returns the known address of `peer`.
    pub fn route(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.routes.read().get(peer).copied()
    }

    /// Number of peers with a known route.
    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }

    /// Spawns the receive loop handing inbound frames to `overlay`.
    pub fn spawn_receiver(
        self: &Arc<Self>,
        overlay: Arc<RendezvousOverlay>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = endpoint.socket.recv_from(&mut buf) => match result {
                        Ok((len, addr)) => endpoint.receive(&overlay, &buf[..len], addr),
                        Err(e) => warn!(error = %e, "Socket receive error"),
                    },
                }
            }
            debug!("UDP receiver stopped");
        })
    }

    fn receive(&self, overlay: &RendezvousOverlay, datagram: &[u8], addr: SocketAddr) {
        let frame = match Frame::from_bytes(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(addr = %addr, error = %e, "Dropped undecodable datagram");
                return;
            }
        };
        // Our own broadcasts come back to us.
        if frame.sender == self.local {
            return;
        }
        self.learn_route(frame.sender, addr);
        overlay.handle_message(frame.sender, frame.message);
    }
}

#[async_trait]
impl Endpoint for UdpEndpoint {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn local_addresses(&self) -> Vec<String> {
        vec![format!("{}{}", UDP_SCHEME, self.local_addr)]
    }

    fn messenger(&self, peer: &PeerId, hints: &[String]) -> Option<Arc<dyn Messenger>> {
        let addr = self
            .route(peer)
            .or_else(|| hints.iter().find_map(|h| parse_address(h)))?;
        self.learn_route(*peer, addr);
        Some(Arc::new(UdpMessenger {
            local: self.local,
            socket: Arc::clone(&self.socket),
            addr,
        }))
    }

    async fn broadcast(&self, message: Message) -> Result<(), TransportError> {
        let Some(addr) = self.broadcast_addr else {
            return Ok(());
        };
        let wire = encode_frame(self.local, message)?;
        self.socket.send_to(&wire, addr).await?;
        Ok(())
    }
}

struct UdpMessenger {
    local: PeerId,
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
}

#[async_trait]
impl Messenger for UdpMessenger {
    fn is_closed(&self) -> bool {
        false
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let wire = encode_frame(self.local, message)?;
        let sent = self.socket.send_to(&wire, self.addr).await?;
        trace!(addr = %self.addr, bytes = sent, "Sent frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use ember_overlay::{OverlayConfig, Role};

    async fn node(role: Role) -> (Arc<UdpEndpoint>, Arc<RendezvousOverlay>) {
        let peer = PeerId::random();
        let endpoint = UdpEndpoint::bind(peer, "127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let overlay = RendezvousOverlay::new(OverlayConfig::with_role(role), endpoint.clone());
        (endpoint, overlay)
    }

    #[test]
    fn test_parse_address() {
        let addr: SocketAddr = "127.0.0.1:4300".parse().unwrap();
        assert_eq!(parse_address("udp://127.0.0.1:4300"), Some(addr));
        assert_eq!(parse_address("127.0.0.1:4300"), Some(addr));
        assert_eq!(parse_address("mem://somewhere"), None);
    }

    #[tokio::test]
    async fn test_messenger_needs_route_or_hint() {
        let (endpoint, _overlay) = node(Role::Edge).await;
        let peer = PeerId::random();
        assert!(endpoint.messenger(&peer, &[]).is_none());
        assert!(endpoint
            .messenger(&peer, &["udp://127.0.0.1:9".to_string()])
            .is_some());
        // The hint becomes a route.
        assert!(endpoint.messenger(&peer, &[]).is_some());
    }

    #[tokio::test]
    async fn test_lease_over_udp() {
        let cancel = CancellationToken::new();
        let (rdv_endpoint, rdv) = node(Role::Rendezvous).await;
        let (edge_endpoint, edge) = node(Role::Edge).await;
        let rdv_task = rdv_endpoint.spawn_receiver(rdv.clone(), cancel.clone());
        let edge_task = edge_endpoint.spawn_receiver(edge.clone(), cancel.clone());

        edge.connect(rdv.local_peer(), &rdv_endpoint.local_addresses())
            .unwrap();

        let mut leased = false;
        for _ in 0..100 {
            if edge.connected_rendezvous() == vec![rdv.local_peer()] {
                leased = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(leased);
        assert_eq!(rdv.connected_clients(), vec![edge.local_peer()]);
        assert_eq!(
            rdv_endpoint.route(&edge.local_peer()),
            Some(edge_endpoint.local_addr())
        );

        cancel.cancel();
        rdv_task.await.unwrap();
        edge_task.await.unwrap();
    }
}
