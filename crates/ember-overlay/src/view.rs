//! Ordered membership view of rendezvous peers.
//!
//! Peers are kept sorted by id so that every node holding the same
//! membership derives the same ordering for replica placement.

use std::collections::BTreeMap;

use ember_core::PeerId;
use parking_lot::RwLock;

/// Known rendezvous peers with their route hints.
#[derive(Debug)]
pub struct PeerView {
    local: PeerId,
    peers: RwLock<BTreeMap<PeerId, Vec<String>>>,
}

impl PeerView {
    /// Creates an empty view for `local`.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds or refreshes a peer. Non-empty `hints` replace the stored route
    /// hints. Returns true if the peer was not yet known. The local peer is
    /// never stored.
    pub fn add(&self, peer: PeerId, hints: &[String]) -> bool {
        if peer == self.local {
            return false;
        }
        let mut peers = self.peers.write();
        match peers.get_mut(&peer) {
            Some(existing) => {
                if !hints.is_empty() {
                    *existing = hints.to_vec();
                }
                false
            }
            None => {
                peers.insert(peer, hints.to_vec());
                true
            }
        }
    }

    /// Removes a peer. Returns true if it was present.
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.peers.write().remove(peer).is_some()
    }

    /// Returns true if `peer` is in the view.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Number of remote peers in the view.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Returns true if no remote peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Route hints recorded for `peer`.
    pub fn hints(&self, peer: &PeerId) -> Vec<String> {
        self.peers.read().get(peer).cloned().unwrap_or_default()
    }

    /// Remote peers in id order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    /// Peers in id order, with the local peer merged in when requested.
    pub fn ordered(&self, include_local: bool) -> Vec<PeerId> {
        let mut ordered = self.peers();
        if include_local {
            let pos = ordered.partition_point(|p| *p < self.local);
            ordered.insert(pos, self.local);
        }
        ordered
    }

    /// First peer after the local peer in ring order that `skip` does not
    /// reject.
    pub fn next_in_ring<F>(&self, mut skip: F) -> Option<PeerId>
    where
        F: FnMut(&PeerId) -> bool,
    {
        let peers = self.peers.read();
        let after = peers.range(self.local..).map(|(p, _)| *p);
        let before = peers.range(..self.local).map(|(p, _)| *p);
        after.chain(before).find(|p| !skip(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_peers(n: usize) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = (0..n).map(|_| PeerId::random()).collect();
        peers.sort();
        peers
    }

    #[test]
    fn test_add_remove() {
        let local = PeerId::random();
        let view = PeerView::new(local);
        let peer = PeerId::random();

        assert!(view.add(peer, &["udp://10.0.0.1:9000".to_string()]));
        assert!(!view.add(peer, &[]));
        assert_eq!(view.hints(&peer), vec!["udp://10.0.0.1:9000".to_string()]);
        assert!(!view.add(local, &[]));
        assert_eq!(view.len(), 1);

        assert!(view.remove(&peer));
        assert!(view.is_empty());
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let peers = sorted_peers(4);
        let a = PeerView::new(peers[0]);
        let b = PeerView::new(peers[3]);
        for p in &peers {
            a.add(*p, &[]);
            b.add(*p, &[]);
        }
        assert_eq!(a.ordered(true), peers);
        assert_eq!(b.ordered(true), peers);
        assert_eq!(a.ordered(false), peers[1..].to_vec());
    }

    #[test]
    fn test_next_in_ring_wraps() {
        let peers = sorted_peers(4);
        let view = PeerView::new(peers[2]);
        for p in &peers {
            view.add(*p, &[]);
        }

        assert_eq!(view.next_in_ring(|_| false), Some(peers[3]));
        assert_eq!(view.next_in_ring(|p| *p == peers[3]), Some(peers[0]));
        assert_eq!(view.next_in_ring(|_| true), None);
    }
}
