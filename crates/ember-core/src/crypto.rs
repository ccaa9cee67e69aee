//! Hashing and message authentication.
//!
//! - BLAKE3 digests for peer ids and replica placement
//! - HMAC-SHA-256 for the network credential on index messages
//! - HKDF-SHA-256 to derive the MAC key from the shared network key

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Size in bytes of a [`digest`] output.
pub const DIGEST_SIZE: usize = 32;

/// HKDF info string for the network MAC key.
const NETWORK_MAC_INFO: &[u8] = b"ember/v1/network-mac";

/// Computes the 256-bit BLAKE3 digest of `data`.
pub fn digest(data: &[u8]) -> [u8; DIGEST_SIZE] {
    *blake3::hash(data).as_bytes()
}

/// Computes HMAC-SHA-256 of a message using the given key.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// HKDF-SHA-256 (RFC 5869). An empty salt is treated as 32 zero bytes.
///
/// # Panics
/// Panics if length is 0 or exceeds 8160 bytes (255 * 32)
pub fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let n = (length + 31) / 32;
    assert!((1..=255).contains(&n), "HKDF output length must be 1-8160 bytes");

    let prk = if salt.is_empty() {
        hmac_sha256(&[0u8; 32], ikm)
    } else {
        hmac_sha256(salt, ikm)
    };

    let mut output = Vec::with_capacity(n * 32);
    let mut t: Vec<u8> = Vec::new();
    for i in 1..=n {
        let mut message = t.clone();
        message.extend_from_slice(info);
        message.push(i as u8);
        t = hmac_sha256(&prk, &message).to_vec();
        output.extend_from_slice(&t);
    }

    output.truncate(length);
    output
}

/// Derives the MAC key used to authenticate index messages.
///
/// ```text
/// network_mac_key = HKDF(NetworkKey, salt=∅, info="ember/v1/network-mac", L=32)
/// ```
pub fn network_mac_key(network_key: &[u8; 32]) -> [u8; 32] {
    let okm = hkdf_sha256(network_key, &[], NETWORK_MAC_INFO, 32);
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    key
}

/// Compares two MACs without short-circuiting.
pub fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
