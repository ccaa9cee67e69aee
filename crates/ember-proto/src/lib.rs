//! Ember Protocol - Wire message definitions.
//!
//! This crate defines:
//! - The propagate/walk header carried beside opaque payloads
//! - Rendezvous lease and delivery messages with framing
//! - Distributed index (SRDI) messages and their network credential
//! - Resolver queries and responses forwarded between peers

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod messages;
pub mod propagate;
pub mod resolver;
pub mod srdi;

pub use messages::{Envelope, Frame, Message, MessageType};
pub use propagate::{HeaderError, PropagateHeader};
pub use resolver::{ResolverQuery, ResolverResponse};
pub use srdi::{Credential, SrdiEntry, SrdiMessage, SrdiMessageError};

/// Upper bound on the visited path carried by a propagate header.
pub const MAX_VISITED_PATH: usize = 256;
