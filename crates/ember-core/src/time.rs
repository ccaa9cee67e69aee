//! Timestamps in milliseconds since the Unix epoch.
//!
//! Absolute instants (record lifetimes, lease deadlines, SRDI expirations)
//! are `Timestamp`s; relative spans stay `Duration`s until they are anchored
//! with [`Timestamp::after`].

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};

/// Timestamp in milliseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Creates a new timestamp from milliseconds since Unix epoch.
    pub const fn new(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current time as a timestamp.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Returns the instant `span` after now.
    pub fn after(span: Duration) -> Self {
        Self::now().add(span)
    }

    /// Returns the milliseconds since Unix epoch.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Adds a duration to this timestamp.
    pub fn add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_millis(duration)))
    }

    /// Subtracts a duration from this timestamp.
    pub fn sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_millis(duration)))
    }

    /// Returns true if this instant lies at or before `now`.
    pub fn has_passed(&self, now: Timestamp) -> bool {
        self.0 <= now.0
    }

    /// Time left until this instant, or `None` once it has passed.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.0 > now.0 {
            Some(Duration::from_millis((self.0 - now.0) as u64))
        } else {
            None
        }
    }

    /// Returns the duration between two timestamps.
    pub fn duration_since(&self, earlier: &Timestamp) -> Option<Duration> {
        if self.0 >= earlier.0 {
            Some(Duration::from_millis((self.0 - earlier.0) as u64))
        } else {
            None
        }
    }
}

/// Converts a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl CanonicalEncode for Timestamp {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl CanonicalDecode for Timestamp {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(i64::decode(buf)?))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
