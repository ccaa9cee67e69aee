//! Distributed index (SRDI) messages.
//!
//! A message carries a batch of index entries published by one source peer
//! under one primary key. An entry with zero expiration is a tombstone.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ember_core::crypto::{constant_time_eq, hmac_sha256, network_mac_key};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::{NetworkKey, PeerId};
use thiserror::Error;

/// SRDI message errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SrdiMessageError {
    /// No credential attached where one is required
    #[error("Missing credential")]
    MissingCredential,

    /// Credential does not match the message body
    #[error("Invalid credential")]
    InvalidCredential,
}

/// One index entry: secondary key, value and relative expiration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrdiEntry {
    /// Secondary key (attribute name)
    pub key: String,
    /// Attribute value
    pub value: String,
    /// Relative expiration in milliseconds
    pub expiration_ms: u64,
}

impl SrdiEntry {
    /// Creates an entry.
    pub fn new(key: impl Into<String>, value: impl Into<String>, expiration: Duration) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expiration_ms: u64::try_from(expiration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Relative expiration.
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    /// Returns true if this entry announces a removal.
    pub fn is_tombstone(&self) -> bool {
        self.expiration_ms == 0
    }
}

impl CanonicalEncode for SrdiEntry {
    fn encode(&self, buf: &mut BytesMut) {
        self.key.encode(buf);
        self.value.encode(buf);
        self.expiration_ms.encode(buf);
    }
}

impl CanonicalDecode for SrdiEntry {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            key: String::decode(buf)?,
            value: String::decode(buf)?,
            expiration_ms: u64::decode(buf)?,
        })
    }
}

/// Network credential: HMAC of the message body under the network MAC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    /// MAC bytes
    pub mac: [u8; 32],
}

impl CanonicalEncode for Credential {
    fn encode(&self, buf: &mut BytesMut) {
        self.mac.encode(buf);
    }
}

impl CanonicalDecode for Credential {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            mac: <[u8; 32]>::decode(buf)?,
        })
    }
}

/// Batch of index entries pushed or replicated between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrdiMessage {
    /// Peer that published the entries (kept unchanged across replication)
    pub source_peer: PeerId,
    /// Primary key (the index area, e.g. "Peers")
    pub primary_key: String,
    /// Remaining replication hops
    pub ttl: u32,
    /// Entries
    pub entries: Vec<SrdiEntry>,
    /// Optional credential over the body
    pub credential: Option<Credential>,
}

impl SrdiMessage {
    /// Creates an unauthenticated message.
    pub fn new(source_peer: PeerId, primary_key: &str, ttl: u32, entries: Vec<SrdiEntry>) -> Self {
        Self {
            source_peer,
            primary_key: primary_key.to_string(),
            ttl,
            entries,
            credential: None,
        }
    }

    /// Encodes everything but the credential.
    pub fn body_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.source_peer.encode(&mut buf);
        self.primary_key.encode(&mut buf);
        self.ttl.encode(&mut buf);
        self.entries.encode(&mut buf);
        buf.freeze()
    }

    /// Computes the credential for this body under `network_key`.
    pub fn compute_credential(&self, network_key: &NetworkKey) -> Credential {
        let mac_key = network_mac_key(network_key.as_bytes());
        Credential {
            mac: hmac_sha256(&mac_key, &self.body_bytes()),
        }
    }

    /// Attaches a credential computed under `network_key`.
    pub fn sign(&mut self, network_key: &NetworkKey) {
        self.credential = Some(self.compute_credential(network_key));
    }

    /// Verifies the attached credential.
    pub fn verify(&self, network_key: &NetworkKey) -> Result<(), SrdiMessageError> {
        let credential = self
            .credential
            .as_ref()
            .ok_or(SrdiMessageError::MissingCredential)?;
        let expected = self.compute_credential(network_key);
        if constant_time_eq(&credential.mac, &expected.mac) {
            Ok(())
        } else {
            Err(SrdiMessageError::InvalidCredential)
        }
    }
}

impl CanonicalEncode for SrdiMessage {
    fn encode(&self, buf: &mut BytesMut) {
        self.source_peer.encode(buf);
        self.primary_key.encode(buf);
        self.ttl.encode(buf);
        self.entries.encode(buf);
        self.credential.encode(buf);
    }
}

impl CanonicalDecode for SrdiMessage {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            source_peer: PeerId::decode(buf)?,
            primary_key: String::decode(buf)?,
            ttl: u32::decode(buf)?,
            entries: Vec::<SrdiEntry>::decode(buf)?,
            credential: Option::<Credential>::decode(buf)?,
        })
    }
}
