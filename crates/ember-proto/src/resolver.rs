//! Resolver queries and responses.
//!
//! Queries are forwarded between rendezvous peers with a hop counter that
//! bounds amplification.

use bytes::{Bytes, BytesMut};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::PeerId;

/// A query addressed to a named handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverQuery {
    /// Handler the query is addressed to
    pub handler_name: String,
    /// Query id chosen by the originator
    pub query_id: u64,
    /// Originating peer, where responses go
    pub src_peer: PeerId,
    /// Number of times the query has been forwarded
    pub hop_count: u32,
    /// Opaque query body
    pub query: Bytes,
}

impl ResolverQuery {
    /// Creates a query with a zero hop count.
    pub fn new(handler_name: &str, query_id: u64, src_peer: PeerId, query: Bytes) -> Self {
        Self {
            handler_name: handler_name.to_string(),
            query_id,
            src_peer,
            hop_count: 0,
            query,
        }
    }

    /// Increments the hop count, returning the new value.
    pub fn increment_hop_count(&mut self) -> u32 {
        self.hop_count = self.hop_count.saturating_add(1);
        self.hop_count
    }
}

impl CanonicalEncode for ResolverQuery {
    fn encode(&self, buf: &mut BytesMut) {
        self.handler_name.encode(buf);
        self.query_id.encode(buf);
        self.src_peer.encode(buf);
        self.hop_count.encode(buf);
        self.query.encode(buf);
    }
}

impl CanonicalDecode for ResolverQuery {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            handler_name: String::decode(buf)?,
            query_id: u64::decode(buf)?,
            src_peer: PeerId::decode(buf)?,
            hop_count: u32::decode(buf)?,
            query: Bytes::decode(buf)?,
        })
    }
}

/// A response to a [`ResolverQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverResponse {
    /// Handler that produced the response
    pub handler_name: String,
    /// Id of the query answered
    pub query_id: u64,
    /// Opaque response body
    pub response: Bytes,
}

impl ResolverResponse {
    /// Creates the response to `query`.
    pub fn for_query(query: &ResolverQuery, response: Bytes) -> Self {
        Self {
            handler_name: query.handler_name.clone(),
            query_id: query.query_id,
            response,
        }
    }
}

impl CanonicalEncode for ResolverResponse {
    fn encode(&self, buf: &mut BytesMut) {
        self.handler_name.encode(buf);
        self.query_id.encode(buf);
        self.response.encode(buf);
    }
}

impl CanonicalDecode for ResolverResponse {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            handler_name: String::decode(buf)?,
            query_id: u64::decode(buf)?,
            response: Bytes::decode(buf)?,
        })
    }
}
