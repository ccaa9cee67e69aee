//! Transport-facing collaborator traits.
//!
//! The overlay never touches sockets. An [`Endpoint`] resolves per-peer
//! [`Messenger`]s and performs local broadcast; inbound traffic is handed to
//! [`crate::RendezvousOverlay::handle_message`] by whoever owns the transport.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ember_core::PeerId;
use ember_proto::Message;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Messenger closed
    #[error("Messenger closed")]
    Closed,

    /// Send failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// No address known for the peer
    #[error("Unreachable peer: {0}")]
    Unreachable(PeerId),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A channel to one remote peer.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Returns true once the messenger can no longer send.
    fn is_closed(&self) -> bool;

    /// Sends a message to the remote peer.
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Endpoint service moving messages between hosts.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Returns the local peer ID.
    fn local_peer(&self) -> PeerId;

    /// Returns the addresses the local peer can be reached at.
    fn local_addresses(&self) -> Vec<String>;

    /// Resolves a messenger to `peer`, trying `hints` when the peer has no
    /// known route.
    fn messenger(&self, peer: &PeerId, hints: &[String]) -> Option<Arc<dyn Messenger>>;

    /// Sends to every peer on the local subnet.
    async fn broadcast(&self, message: Message) -> Result<(), TransportError>;
}

/// Receiver of messages addressed to a named service.
pub trait ServiceHandler: Send + Sync {
    /// Handles a payload delivered by the overlay.
    fn on_message(&self, from: PeerId, param: &str, payload: Bytes);
}
