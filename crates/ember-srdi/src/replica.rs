//! Replica placement.
//!
//! An expression is hashed to a 256-bit digest `d` and mapped onto an
//! ordered view of `n` peers at position `floor(d * n / 2^256)`. Every peer
//! holding the same view picks the same replica.

use ember_core::crypto::{digest, DIGEST_SIZE};
use ember_core::PeerId;

/// Maps a big-endian digest onto `[0, n)`.
pub fn replica_index(digest: &[u8; DIGEST_SIZE], n: usize) -> usize {
    // Long multiplication from the least significant byte; the final carry
    // is the part of the product above 2^256.
    let n = n as u128;
    let mut carry: u128 = 0;
    for byte in digest.iter().rev() {
        carry = (u128::from(*byte) * n + carry) >> 8;
    }
    carry as usize
}

/// Picks the replica for `expression` from an ordered view. Returns `None`
/// when the view is smaller than `threshold`.
pub fn select_replica(view: &[PeerId], expression: &str, threshold: usize) -> Option<PeerId> {
    if view.is_empty() || view.len() < threshold {
        return None;
    }
    let position = replica_index(&digest(expression.as_bytes()), view.len());
    view.get(position).copied()
}
