//! Propagate header rules shared by flooding and walking.
//!
//! On receipt a header passes [`check_incoming`] or the message is dropped.
//! Before forwarding, [`update_header`] charges the hop against the TTL and
//! records the local peer in the visited path.

use ember_core::PeerId;
use ember_proto::{Envelope, HeaderError, PropagateHeader};

use crate::dedup::DuplicateFilter;

/// Why an incoming propagated message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No header element
    MissingHeader,
    /// Header element could not be parsed
    MalformedHeader,
    /// TTL already exhausted
    TtlExpired,
    /// Message id seen before
    Duplicate,
    /// Local peer already on the visited path
    Loop,
}

/// Validates an incoming envelope and records its message id.
///
/// The id is recorded only once the TTL check has passed, so an exhausted
/// copy does not shadow a live one arriving later.
pub fn check_incoming(
    envelope: &Envelope,
    local: &PeerId,
    seen: &mut DuplicateFilter,
) -> Result<PropagateHeader, DropReason> {
    let header = envelope.parse_header().map_err(|e| match e {
        HeaderError::Missing => DropReason::MissingHeader,
        _ => DropReason::MalformedHeader,
    })?;

    if header.ttl <= 0 {
        return Err(DropReason::TtlExpired);
    }
    if !seen.insert(header.message_id) {
        return Err(DropReason::Duplicate);
    }
    if header.is_visited(local) {
        return Err(DropReason::Loop);
    }
    Ok(header)
}

/// Prepares a header for the next hop.
///
/// The TTL drops by one unless the local peer is already on the path, is
/// capped at `max_ttl`, and the local peer is appended to the path. Returns
/// `None` when no TTL is left for another hop.
pub fn update_header(
    mut header: PropagateHeader,
    local: &PeerId,
    max_ttl: i32,
) -> Option<PropagateHeader> {
    if !header.is_visited(local) {
        header.ttl = header.ttl.saturating_sub(1).max(0);
    }
    header.ttl = header.ttl.min(max_ttl);
    header.add_visited(*local);

    if header.ttl > 0 {
        Some(header)
    } else {
        None
    }
}
