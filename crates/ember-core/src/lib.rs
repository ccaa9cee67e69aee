//! Ember Core - Core types and primitives for the Ember overlay.
//!
//! This crate provides:
//! - Identifier types (PeerId, MessageId)
//! - Millisecond timestamps and relative lifetimes
//! - Canonical binary encoding used by the wire and storage formats
//! - Hashing and MAC helpers
//! - The shared network key

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod encoding;
pub mod identifiers;
pub mod keys;
pub mod time;

pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
pub use identifiers::*;
pub use keys::NetworkKey;
pub use time::*;

/// Wire protocol version carried in framed messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capacity of the duplicate-suppression ring of message ids.
pub const MESSAGE_ID_RING_CAPACITY: usize = 1000;
