//! Ember SRDI - Shared distributed index coordination.
//!
//! Implements:
//! - Deterministic replica placement over the membership view
//! - Replication of pushed index entries between rendezvous peers
//! - Hop-bounded forwarding and answering of resolver queries
//! - The periodic push worker driven by membership events

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod coordinator;
pub mod credential;
pub mod publisher;
pub mod query;
pub mod replica;

pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorStats, IndexCoordinator};
pub use credential::{CredentialProvider, NetworkCredential};
pub use publisher::{SrdiPublisher, StorePublisher};
pub use query::QueryHandler;
pub use replica::{replica_index, select_replica};

use thiserror::Error;

/// Overlay service name index messages are addressed to.
pub const SRDI_SERVICE: &str = "srdi";

/// Overlay service name forwarded resolver queries are addressed to.
pub const RESOLVER_SERVICE: &str = "resolver";

/// Overlay service name resolver responses are addressed to.
pub const RESOLVER_RESPONSE_SERVICE: &str = "resolver-response";

/// Default interval between delta pushes (30 seconds).
pub const DEFAULT_PUSH_INTERVAL_SECS: u64 = 30;

/// Default poll interval while no rendezvous connection exists.
pub const DEFAULT_MEMBERSHIP_WAIT_SECS: u64 = 5;

/// Minimum view size for replica placement.
pub const DEFAULT_REPLICATION_THRESHOLD: usize = 3;

/// Forwarding hops after which a resolver query is dropped.
pub const DEFAULT_MAX_HOP_COUNT: u32 = 2;

/// Peers an unanswered query is passed on to.
pub const DEFAULT_FORWARD_THRESHOLD: usize = 3;

/// TTL on messages pushed by the publishing peer. Replicas carry zero.
pub const PUSH_TTL: u32 = 1;

/// SRDI errors.
#[derive(Debug, Error)]
pub enum SrdiError {
    /// Message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] ember_core::DecodeError),

    /// Credential missing or wrong
    #[error("Credential error: {0}")]
    Credential(#[from] ember_proto::SrdiMessageError),

    /// Local index failure
    #[error("Store error: {0}")]
    Store(#[from] ember_store::StoreError),

    /// Overlay refused the send
    #[error("Overlay error: {0}")]
    Overlay(#[from] ember_overlay::OverlayError),
}
