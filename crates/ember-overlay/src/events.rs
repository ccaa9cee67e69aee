//! Membership events published by the overlay.

use ember_core::PeerId;

/// Connection and role changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Lease granted by a new rendezvous
    RendezvousConnect(PeerId),
    /// Lease renewed by a known rendezvous
    RendezvousReconnect(PeerId),
    /// Rendezvous lease ended or was closed
    RendezvousDisconnect(PeerId),
    /// Sending to a rendezvous failed
    RendezvousFailed(PeerId),
    /// New client leased from us
    ClientConnect(PeerId),
    /// Known client renewed its lease
    ClientReconnect(PeerId),
    /// Client lease ended or was closed
    ClientDisconnect(PeerId),
    /// Sending to a client failed
    ClientFailed(PeerId),
    /// Local peer became a rendezvous
    BecameRendezvous,
    /// Local peer became an edge
    BecameEdge,
}

impl OverlayEvent {
    /// Peer the event is about, if any.
    pub fn peer(&self) -> Option<PeerId> {
        match self {
            OverlayEvent::RendezvousConnect(p)
            | OverlayEvent::RendezvousReconnect(p)
            | OverlayEvent::RendezvousDisconnect(p)
            | OverlayEvent::RendezvousFailed(p)
            | OverlayEvent::ClientConnect(p)
            | OverlayEvent::ClientReconnect(p)
            | OverlayEvent::ClientDisconnect(p)
            | OverlayEvent::ClientFailed(p) => Some(*p),
            OverlayEvent::BecameRendezvous | OverlayEvent::BecameEdge => None,
        }
    }

    /// True for (re)connections that call for a full index resync.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            OverlayEvent::RendezvousConnect(_)
                | OverlayEvent::RendezvousReconnect(_)
                | OverlayEvent::ClientConnect(_)
                | OverlayEvent::ClientReconnect(_)
        )
    }

    /// True when a peer went away, cleanly or not.
    pub fn is_departure(&self) -> bool {
        matches!(
            self,
            OverlayEvent::RendezvousDisconnect(_)
                | OverlayEvent::RendezvousFailed(_)
                | OverlayEvent::ClientDisconnect(_)
                | OverlayEvent::ClientFailed(_)
        )
    }
}
