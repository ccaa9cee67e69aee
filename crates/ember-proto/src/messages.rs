//! Overlay message types and framing.
//!
//! Defines the messages exchanged between rendezvous overlay peers. Payloads
//! of propagated, walked and direct messages are opaque to the overlay.

use bytes::{Bytes, BytesMut};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::{PeerId, PROTOCOL_VERSION};

use crate::propagate::{HeaderError, PropagateHeader};

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Edge asks a rendezvous for a lease
    LeaseRequest = 0,
    /// Rendezvous grants a lease
    LeaseGranted = 1,
    /// Either side ends the connection
    Disconnect = 2,
    /// Flooded message
    Propagate = 10,
    /// Hop-by-hop directed message
    Walk = 11,
    /// Point-to-point service message
    Direct = 20,
}

impl MessageType {
    /// Returns the tag value.
    pub fn tag(&self) -> u32 {
        *self as u32
    }

    /// Creates from a tag value.
    pub fn from_tag(tag: u32) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(MessageType::LeaseRequest),
            1 => Ok(MessageType::LeaseGranted),
            2 => Ok(MessageType::Disconnect),
            10 => Ok(MessageType::Propagate),
            11 => Ok(MessageType::Walk),
            20 => Ok(MessageType::Direct),
            _ => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// Opaque payload with an optional propagate header side element.
///
/// The header travels as encoded bytes so that a peer can still recognise
/// (and drop) an envelope whose header it cannot parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Encoded [`PropagateHeader`], if present
    pub header: Option<Bytes>,
    /// Application payload
    pub payload: Bytes,
}

impl Envelope {
    /// Wraps a payload with the given header.
    pub fn new(header: &PropagateHeader, payload: Bytes) -> Self {
        Self {
            header: Some(header.to_bytes()),
            payload,
        }
    }

    /// Parses and validates the header element.
    pub fn parse_header(&self) -> Result<PropagateHeader, HeaderError> {
        let raw = self.header.as_ref().ok_or(HeaderError::Missing)?;
        let header = PropagateHeader::from_bytes(raw)?;
        header.validate()?;
        Ok(header)
    }

    /// Returns a copy of this envelope carrying `header` instead.
    pub fn with_header(&self, header: &PropagateHeader) -> Self {
        Self::new(header, self.payload.clone())
    }
}

impl CanonicalEncode for Envelope {
    fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        self.payload.encode(buf);
    }
}

impl CanonicalDecode for Envelope {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            header: Option::<Bytes>::decode(buf)?,
            payload: Bytes::decode(buf)?,
        })
    }
}

/// Overlay message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request (or renew) a lease from a rendezvous
    LeaseRequest {
        /// Requested lease length in milliseconds
        lease_ms: u64,
        /// Addresses the requester can be reached at
        addresses: Vec<String>,
        /// True if the requester acts as a rendezvous itself
        rendezvous: bool,
    },
    /// Lease granted by a rendezvous
    LeaseGranted {
        /// Granted lease length in milliseconds
        lease_ms: u64,
        /// Addresses the rendezvous can be reached at
        addresses: Vec<String>,
        /// Rendezvous peers known to the granting peer
        view: Vec<PeerId>,
    },
    /// Connection closed by the sender
    Disconnect,
    /// Flooded message
    Propagate(Envelope),
    /// Walked message
    Walk(Envelope),
    /// Point-to-point message for a local service
    Direct {
        /// Destination service name
        service: String,
        /// Destination service parameter
        param: String,
        /// Opaque payload
        payload: Bytes,
    },
}

impl Message {
    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::LeaseRequest { .. } => MessageType::LeaseRequest,
            Message::LeaseGranted { .. } => MessageType::LeaseGranted,
            Message::Disconnect => MessageType::Disconnect,
            Message::Propagate(_) => MessageType::Propagate,
            Message::Walk(_) => MessageType::Walk,
            Message::Direct { .. } => MessageType::Direct,
        }
    }
}

impl CanonicalEncode for Message {
    fn encode(&self, buf: &mut BytesMut) {
        self.message_type().tag().encode(buf);
        match self {
            Message::LeaseRequest {
                lease_ms,
                addresses,
                rendezvous,
            } => {
                lease_ms.encode(buf);
                addresses.encode(buf);
                rendezvous.encode(buf);
            }
            Message::LeaseGranted {
                lease_ms,
                addresses,
                view,
            } => {
                lease_ms.encode(buf);
                addresses.encode(buf);
                view.encode(buf);
            }
            Message::Disconnect => {}
            Message::Propagate(envelope) | Message::Walk(envelope) => envelope.encode(buf),
            Message::Direct {
                service,
                param,
                payload,
            } => {
                service.encode(buf);
                param.encode(buf);
                payload.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for Message {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let message_type = MessageType::from_tag(u32::decode(buf)?)?;
        let message = match message_type {
            MessageType::LeaseRequest => Message::LeaseRequest {
                lease_ms: u64::decode(buf)?,
                addresses: Vec::<String>::decode(buf)?,
                rendezvous: bool::decode(buf)?,
            },
            MessageType::LeaseGranted => Message::LeaseGranted {
                lease_ms: u64::decode(buf)?,
                addresses: Vec::<String>::decode(buf)?,
                view: Vec::<PeerId>::decode(buf)?,
            },
            MessageType::Disconnect => Message::Disconnect,
            MessageType::Propagate => Message::Propagate(Envelope::decode(buf)?),
            MessageType::Walk => Message::Walk(Envelope::decode(buf)?),
            MessageType::Direct => Message::Direct {
                service: String::decode(buf)?,
                param: String::decode(buf)?,
                payload: Bytes::decode(buf)?,
            },
        };
        Ok(message)
    }
}

/// A message as carried by a datagram transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version of the sender
    pub version: u32,
    /// Sending peer
    pub sender: PeerId,
    /// Message body
    pub message: Message,
}

impl Frame {
    /// Frames a message from `sender` at the current protocol version.
    pub fn new(sender: PeerId, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sender,
            message,
        }
    }
}

impl CanonicalEncode for Frame {
    fn encode(&self, buf: &mut BytesMut) {
        self.version.encode(buf);
        self.sender.encode(buf);
        self.message.encode(buf);
    }
}

impl CanonicalDecode for Frame {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let version = u32::decode(buf)?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::Custom(format!(
                "Unsupported protocol version {}",
                version
            )));
        }
        Ok(Self {
            version,
            sender: PeerId::decode(buf)?,
            message: Message::decode(buf)?,
        })
    }
}
