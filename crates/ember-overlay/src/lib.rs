//! Ember Overlay - Rendezvous membership and message propagation.
//!
//! Implements:
//! - Leased peer connections between edge and rendezvous peers
//! - Flooded (propagate) and directed (walk) delivery with TTL, loop and
//!   duplicate control
//! - An ordered membership view of rendezvous peers
//! - Edge/rendezvous role switching driven by a watchdog

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod dedup;
pub mod endpoint;
pub mod events;
pub mod propagation;
pub mod service;
pub mod view;

pub use config::{OverlayConfig, Role};
pub use connection::{ConnectionState, PeerConnection};
pub use dedup::DuplicateFilter;
pub use endpoint::{Endpoint, Messenger, ServiceHandler, TransportError};
pub use events::OverlayEvent;
pub use propagation::{check_incoming, update_header, DropReason};
pub use service::{OverlayStats, RendezvousOverlay};
pub use view::PeerView;

use thiserror::Error;

/// Default maximum TTL a propagated message may carry.
pub const DEFAULT_MAX_TTL: i32 = 200;

/// Default TTL for newly propagated messages.
pub const DEFAULT_PROPAGATE_TTL: i32 = 10;

/// Default lease granted to and requested from rendezvous peers (20 minutes).
pub const DEFAULT_LEASE_SECS: u64 = 1200;

/// Default interval between role watchdog evaluations (5 minutes).
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 300;

/// Default interval between lease maintenance passes.
pub const DEFAULT_LEASE_CHECK_INTERVAL_SECS: u64 = 30;

/// View size above which a rendezvous considers demoting itself.
pub const DEFAULT_DEMOTE_VIEW_SIZE: usize = 5;

/// Client count below which a rendezvous in a large view may demote.
pub const DEFAULT_LOW_CLIENT_COUNT: usize = 3;

/// Chance of demoting with few clients in a large view.
pub const DEFAULT_DEMOTE_PROBABILITY: f64 = 0.05;

/// Default capacity of the overlay event channel.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;

/// Overlay errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// Another role switch is in flight
    #[error("Role switch already in progress, retry later")]
    SwitchInProgress,

    /// The operation does not apply to the current role
    #[error("Operation not available in role {0:?}")]
    InvalidRole(Role),

    /// No route to the peer
    #[error("No route to peer {0}")]
    NoRoute(ember_core::PeerId),
}
