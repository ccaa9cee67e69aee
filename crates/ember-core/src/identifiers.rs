//! Identifier types.
//!
//! - `PeerId` - identity of a peer in the overlay
//! - `MessageId` - globally unique id of a propagated message

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::crypto::digest;
use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// URI scheme prefix used when a peer id is rendered as a URI.
pub const PEER_URI_PREFIX: &str = "urn:ember:peer:";

macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Creates a new identifier from a 32-byte array.
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Generates a random identifier.
            pub fn random() -> Self {
                use rand::RngCore;
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                Self(bytes)
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Creates from a hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Returns as a hex string.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..16])
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl CanonicalEncode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                self.0.encode(buf);
            }
        }

        impl CanonicalDecode for $name {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                Ok(Self(<[u8; 32]>::decode(buf)?))
            }
        }
    };
}

define_id_type!(
    /// Identity of a peer in the overlay.
    ///
    /// Ordered by raw bytes; the membership view relies on this ordering
    /// being identical on every peer.
    PeerId
);

define_id_type!(
    /// Globally unique id of a propagated or walked message.
    MessageId
);

impl PeerId {
    /// Derives a peer id from a stable seed (for example a public key).
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(digest(seed))
    }

    /// Renders the peer id as a URI, the form carried in visited paths.
    pub fn to_uri(&self) -> String {
        format!("{}{}", PEER_URI_PREFIX, self.to_hex())
    }

    /// Parses a peer URI produced by [`PeerId::to_uri`].
    pub fn from_uri(uri: &str) -> Option<Self> {
        uri.strip_prefix(PEER_URI_PREFIX)
            .and_then(|hex| Self::from_hex(hex).ok())
    }
}

impl FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::from_uri(s) {
            Some(id) => Ok(id),
            None => Self::from_hex(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::random();
        let parsed = PeerId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_peer_id_uri() {
        let id = PeerId::random();
        let uri = id.to_uri();
        assert!(uri.starts_with(PEER_URI_PREFIX));
        assert_eq!(PeerId::from_uri(&uri), Some(id));
        assert_eq!(uri.parse::<PeerId>().unwrap(), id);
        assert_eq!(PeerId::from_uri("urn:other:1234"), None);
    }

    #[test]
    fn test_from_seed_deterministic() {
        assert_eq!(PeerId::from_seed(b"alpha"), PeerId::from_seed(b"alpha"));
        assert_ne!(PeerId::from_seed(b"alpha"), PeerId::from_seed(b"beta"));
    }

    #[test]
    fn test_invalid_hex_length() {
        assert!(PeerId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_display_truncated() {
        let id = PeerId::new([0xab; 32]);
        assert_eq!(format!("{}", id), "abababababababab");
        assert_eq!(format!("{:?}", id), "PeerId(abababababababab)");
    }
}
