//! The shared network key.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Network membership secret.
///
/// Peers holding the same key can authenticate each other's index messages.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey(pub [u8; 32]);

impl NetworkKey {
    /// Creates a new network key from bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates a random network key.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a hex-encoded key.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkKey([REDACTED])")
    }
}

impl Drop for NetworkKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_key_debug_redacted() {
        let key = NetworkKey::random();
        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&hex::encode(key.0)));
    }

    #[test]
    fn test_from_hex() {
        let key = NetworkKey::from_hex(&"11".repeat(32)).unwrap();
        assert_eq!(key.as_bytes(), &[0x11; 32]);
        assert!(NetworkKey::from_hex("11").is_err());
    }
}
