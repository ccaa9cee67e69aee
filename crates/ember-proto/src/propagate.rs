//! Propagate/walk header.
//!
//! Attached as a side element to an otherwise opaque payload. Each hop may
//! rewrite it: the TTL shrinks and the visited path grows.

use bytes::{Bytes, BytesMut};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::{MessageId, PeerId};
use thiserror::Error;

use crate::MAX_VISITED_PATH;

/// Reasons a received header is unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// The envelope carried no header element
    #[error("Missing propagate header")]
    Missing,

    /// The header element could not be decoded
    #[error("Malformed propagate header: {0}")]
    Malformed(#[from] DecodeError),

    /// Destination service name is empty
    #[error("Empty destination service name")]
    EmptyService,

    /// Visited path is longer than allowed
    #[error("Visited path too long: {0}")]
    PathTooLong(usize),
}

/// Routing header for propagated and walked messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagateHeader {
    /// Globally unique message id
    pub message_id: MessageId,
    /// Destination service name
    pub service_name: String,
    /// Destination service parameter
    pub service_param: String,
    /// Remaining hops; zero or less means the message must not travel further
    pub ttl: i32,
    /// Peers that have already seen this message, in visit order
    pub visited: Vec<PeerId>,
}

impl PropagateHeader {
    /// Creates a header for a fresh message with a random id.
    pub fn new(service_name: &str, service_param: &str, ttl: i32) -> Self {
        Self {
            message_id: MessageId::random(),
            service_name: service_name.to_string(),
            service_param: service_param.to_string(),
            ttl,
            visited: Vec::new(),
        }
    }

    /// Returns true if `peer` is already on the visited path.
    pub fn is_visited(&self, peer: &PeerId) -> bool {
        self.visited.contains(peer)
    }

    /// Adds `peer` to the visited path unless it is already present.
    pub fn add_visited(&mut self, peer: PeerId) {
        if !self.is_visited(&peer) {
            self.visited.push(peer);
        }
    }

    /// Checks structural validity.
    pub fn validate(&self) -> Result<(), HeaderError> {
        if self.service_name.is_empty() {
            return Err(HeaderError::EmptyService);
        }
        if self.visited.len() > MAX_VISITED_PATH {
            return Err(HeaderError::PathTooLong(self.visited.len()));
        }
        Ok(())
    }
}

impl CanonicalEncode for PropagateHeader {
    fn encode(&self, buf: &mut BytesMut) {
        self.message_id.encode(buf);
        self.service_name.encode(buf);
        self.service_param.encode(buf);
        self.ttl.encode(buf);
        self.visited.encode(buf);
    }
}

impl CanonicalDecode for PropagateHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            message_id: MessageId::decode(buf)?,
            service_name: String::decode(buf)?,
            service_param: String::decode(buf)?,
            ttl: i32::decode(buf)?,
            visited: Vec::<PeerId>::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_visited_is_idempotent() {
        let mut header = PropagateHeader::new("svc", "", 3);
        let peer = PeerId::random();
        header.add_visited(peer);
        header.add_visited(peer);
        assert_eq!(header.visited.len(), 1);
        assert!(header.is_visited(&peer));
    }

    #[test]
    fn test_validate_empty_service() {
        let header = PropagateHeader::new("", "param", 3);
        assert_eq!(header.validate(), Err(HeaderError::EmptyService));
    }

    #[test]
    fn test_validate_path_too_long() {
        let mut header = PropagateHeader::new("svc", "", 3);
        header.visited = (0..=MAX_VISITED_PATH).map(|_| PeerId::random()).collect();
        assert!(matches!(
            header.validate(),
            Err(HeaderError::PathTooLong(_))
        ));
    }

    #[test]
    fn test_decode_preserves_fields() {
        let mut header = PropagateHeader::new("discovery", "query", -1);
        header.add_visited(PeerId::random());
        let decoded = PropagateHeader::from_bytes(&header.to_vec()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.ttl, -1);
    }
}
