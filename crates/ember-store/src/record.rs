//! On-disk record format for the document store.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::Timestamp;

use crate::StoreError;

/// Separator between directory and name in a record key.
pub const RECORD_KEY_SEPARATOR: char = '/';

/// Separator between scope and attribute in an index name.
pub const INDEX_NAME_SEPARATOR: char = ':';

/// A stored document with its timing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// Absolute instant after which the record is gone
    pub lifetime: Timestamp,
    /// Relative span the record may be advertised for, in milliseconds
    pub expiration_ms: u64,
    /// Document bytes
    pub content: Bytes,
    /// Indexed (attribute, value) pairs
    pub attributes: Vec<(String, String)>,
}

impl StoredRecord {
    /// Returns true once the absolute lifetime has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.lifetime.has_passed(now)
    }

    /// Remaining lifetime, `None` once expired.
    pub fn remaining_lifetime(&self, now: Timestamp) -> Option<Duration> {
        self.lifetime.remaining(now)
    }

    /// Shareable span: the smaller of the stored expiration and the remaining
    /// lifetime. `None` if expired or never shareable.
    pub fn expiration_time(&self, now: Timestamp) -> Option<Duration> {
        let remaining = self.remaining_lifetime(now)?;
        let expiration = remaining.min(Duration::from_millis(self.expiration_ms));
        if expiration.is_zero() {
            None
        } else {
            Some(expiration)
        }
    }
}

impl CanonicalEncode for StoredRecord {
    fn encode(&self, buf: &mut BytesMut) {
        self.lifetime.encode(buf);
        self.expiration_ms.encode(buf);
        self.content.encode(buf);
        self.attributes.encode(buf);
    }
}

impl CanonicalDecode for StoredRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            lifetime: Timestamp::decode(buf)?,
            expiration_ms: u64::decode(buf)?,
            content: Bytes::decode(buf)?,
            attributes: Vec::<(String, String)>::decode(buf)?,
        })
    }
}

/// Builds the record key for `(dir, name)`.
pub fn record_key(dir: &str, name: &str) -> Result<String, StoreError> {
    validate_dir(dir)?;
    if name.is_empty() {
        return Err(StoreError::InvalidKey(name.to_string()));
    }
    Ok(format!("{}{}{}", dir, RECORD_KEY_SEPARATOR, name))
}

/// Key prefix shared by every record of `dir`.
pub fn dir_prefix(dir: &str) -> Result<String, StoreError> {
    validate_dir(dir)?;
    Ok(format!("{}{}", dir, RECORD_KEY_SEPARATOR))
}

/// Splits a record key back into `(dir, name)`.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(RECORD_KEY_SEPARATOR)
}

/// Builds the index name of `attribute` within `scope` (a directory or a
/// primary key). Neither part may contain [`INDEX_NAME_SEPARATOR`], so
/// distinct pairs never share a name.
pub fn index_name(scope: &str, attribute: &str) -> Result<String, StoreError> {
    validate_index_part(attribute)?;
    Ok(format!("{}{}", index_prefix(scope)?, attribute))
}

/// Name prefix shared by every index of `scope`.
pub fn index_prefix(scope: &str) -> Result<String, StoreError> {
    validate_index_part(scope)?;
    Ok(format!("{}{}", scope, INDEX_NAME_SEPARATOR))
}

fn validate_index_part(part: &str) -> Result<(), StoreError> {
    if part.is_empty() || part.contains(INDEX_NAME_SEPARATOR) || part.contains('\0') {
        return Err(StoreError::InvalidKey(part.to_string()));
    }
    Ok(())
}

fn validate_dir(dir: &str) -> Result<(), StoreError> {
    if dir.contains(RECORD_KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(dir.to_string()));
    }
    validate_index_part(dir)
}
