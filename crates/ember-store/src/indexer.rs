//! Secondary index over string attributes.
//!
//! Each named index lives in its own column family (`idx.<name>`) mapping an
//! attribute value to the key of its position list. Position lists live in
//! the shared `positions` column family under `<name>\0<value>` and hold the
//! record keys carrying that value.
//!
//! Exact and prefix searches seek directly into the ordered index. Suffix,
//! contains and negated searches scan the index and filter.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use bytes::Bytes;
use ember_core::encoding::{CanonicalDecode, CanonicalEncode};
use rocksdb::{
    ColumnFamily, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB,
    DEFAULT_COLUMN_FAMILY_NAME,
};
use tracing::{debug, warn};

use crate::query::QueryPattern;
use crate::StoreError;

/// Column family holding every position list.
const POSITIONS_CF: &str = "positions";
/// Column family name prefix for individual indices.
const INDEX_CF_PREFIX: &str = "idx.";
/// Separator between index name and value in a position key.
const KEY_SEPARATOR: u8 = 0x00;

/// Ordered secondary indexer backed by RocksDB.
pub struct Indexer {
    db: DB,
    indices: BTreeSet<String>,
    sync: bool,
}

impl Indexer {
    /// Opens (or creates) an index database, discovering existing indices.
    pub fn open(path: &Path, sync: bool) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut cf_names = DB::list_cf(&Options::default(), path)
            .unwrap_or_else(|_| vec![DEFAULT_COLUMN_FAMILY_NAME.to_string()]);
        if !cf_names.iter().any(|n| n == POSITIONS_CF) {
            cf_names.push(POSITIONS_CF.to_string());
        }

        let db = DB::open_cf(&opts, path, &cf_names)?;
        let indices: BTreeSet<String> = cf_names
            .iter()
            .filter_map(|n| n.strip_prefix(INDEX_CF_PREFIX))
            .map(String::from)
            .collect();

        debug!(path = %path.display(), indices = indices.len(), "Opened indexer");
        Ok(Self { db, indices, sync })
    }

    /// Names of all known indices.
    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.indices.iter().map(String::as_str)
    }

    /// Returns true if `index_name` has been created.
    pub fn has_index(&self, index_name: &str) -> bool {
        self.indices.contains(index_name)
    }

    /// Records that `position` carries `value` under `index_name`.
    pub fn add_to_index(
        &mut self,
        index_name: &str,
        value: &str,
        position: &str,
    ) -> Result<(), StoreError> {
        self.ensure_index(index_name)?;

        let pos_key = positions_key(index_name, value);
        let mut positions = self.load_positions(&pos_key)?;
        if !positions.insert(position.to_string()) {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.positions_cf()?, &pos_key, encode_positions(&positions));
        batch.put_cf(self.index_cf(index_name)?, value.as_bytes(), &pos_key);
        self.write(batch)
    }

    /// Removes `position` from the list for `value` under `index_name`.
    pub fn remove_from_index(
        &mut self,
        index_name: &str,
        value: &str,
        position: &str,
    ) -> Result<(), StoreError> {
        if !self.has_index(index_name) {
            return Ok(());
        }

        let pos_key = positions_key(index_name, value);
        let mut positions = self.load_positions(&pos_key)?;
        if !positions.remove(position) {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        if positions.is_empty() {
            batch.delete_cf(self.positions_cf()?, &pos_key);
            batch.delete_cf(self.index_cf(index_name)?, value.as_bytes());
        } else {
            batch.put_cf(self.positions_cf()?, &pos_key, encode_positions(&positions));
        }
        self.write(batch)
    }

    /// Returns the positions recorded for an exact value.
    pub fn positions(&self, index_name: &str, value: &str) -> Result<Vec<String>, StoreError> {
        if !self.has_index(index_name) {
            return Ok(Vec::new());
        }
        Ok(self
            .load_positions(&positions_key(index_name, value))?
            .into_iter()
            .collect())
    }

    /// Visits every value of `index_name` matching `pattern` together with
    /// its positions, in value order. The callback returns false to stop.
    pub fn search<F>(
        &self,
        index_name: &str,
        pattern: &QueryPattern,
        mut callback: F,
    ) -> Result<(), StoreError>
    where
        F: FnMut(&str, Vec<String>) -> bool,
    {
        if !self.has_index(index_name) {
            return Ok(());
        }
        let index_cf = self.index_cf(index_name)?;

        let mode = match pattern.seek_key() {
            Some(key) => IteratorMode::From(key.as_bytes(), Direction::Forward),
            None => IteratorMode::Start,
        };

        for item in self.db.iterator_cf(index_cf, mode) {
            let (key, pos_key) = item?;
            let value = match std::str::from_utf8(&key) {
                Ok(v) => v,
                Err(_) => {
                    warn!(index = index_name, "Skipping non-UTF-8 index value");
                    continue;
                }
            };
            if !pattern.in_range(value) {
                break;
            }
            if !pattern.matches(value) {
                continue;
            }

            let positions = self.load_positions(&pos_key)?;
            if positions.is_empty() {
                continue;
            }
            if !callback(value, positions.into_iter().collect()) {
                break;
            }
        }
        Ok(())
    }

    /// Drops every position in `stale` from every index, deleting lists
    /// that become empty. Returns the number of positions removed.
    pub fn purge(&mut self, stale: &HashSet<String>) -> Result<usize, StoreError> {
        if stale.is_empty() {
            return Ok(0);
        }

        let positions_cf = self.positions_cf()?;
        let mut batch = WriteBatch::default();
        let mut removed = 0;

        for item in self.db.iterator_cf(positions_cf, IteratorMode::Start) {
            let (pos_key, raw) = item?;
            let mut positions = decode_positions(&raw)?;
            let before = positions.len();
            positions.retain(|p| !stale.contains(p));
            if positions.len() == before {
                continue;
            }
            removed += before - positions.len();

            if positions.is_empty() {
                batch.delete_cf(positions_cf, &pos_key);
                if let Some((index_name, value)) = split_positions_key(&pos_key) {
                    if let Some(cf) = self.db.cf_handle(&index_cf_name(index_name)) {
                        batch.delete_cf(cf, value);
                    }
                }
            } else {
                batch.put_cf(positions_cf, &pos_key, encode_positions(&positions));
            }
        }

        self.write(batch)?;
        debug!(removed, "Purged stale index positions");
        Ok(removed)
    }

    /// Drops every index and position list.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        for name in std::mem::take(&mut self.indices) {
            self.db.drop_cf(&index_cf_name(&name))?;
        }
        self.db.drop_cf(POSITIONS_CF)?;
        self.db.create_cf(POSITIONS_CF, &Options::default())?;
        Ok(())
    }

    fn ensure_index(&mut self, index_name: &str) -> Result<(), StoreError> {
        if self.indices.contains(index_name) {
            return Ok(());
        }
        if index_name.is_empty() || index_name.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(StoreError::InvalidKey(index_name.to_string()));
        }
        self.db
            .create_cf(index_cf_name(index_name), &Options::default())?;
        self.indices.insert(index_name.to_string());
        debug!(index = index_name, "Created index");
        Ok(())
    }

    fn positions_cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(POSITIONS_CF)
            .ok_or_else(|| StoreError::MissingColumnFamily(POSITIONS_CF.to_string()))
    }

    fn index_cf(&self, index_name: &str) -> Result<&ColumnFamily, StoreError> {
        let name = index_cf_name(index_name);
        self.db
            .cf_handle(&name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    fn load_positions(&self, pos_key: &[u8]) -> Result<BTreeSet<String>, StoreError> {
        match self.db.get_cf(self.positions_cf()?, pos_key)? {
            Some(raw) => decode_positions(&raw),
            None => Ok(BTreeSet::new()),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }
}

fn index_cf_name(index_name: &str) -> String {
    format!("{}{}", INDEX_CF_PREFIX, index_name)
}

fn positions_key(index_name: &str, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(index_name.len() + value.len() + 1);
    key.extend_from_slice(index_name.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(value.as_bytes());
    key
}

fn split_positions_key(key: &[u8]) -> Option<(&str, &[u8])> {
    let split = key.iter().position(|b| *b == KEY_SEPARATOR)?;
    let index_name = std::str::from_utf8(&key[..split]).ok()?;
    Some((index_name, &key[split + 1..]))
}

fn encode_positions(positions: &BTreeSet<String>) -> Vec<u8> {
    let list: Vec<String> = positions.iter().cloned().collect();
    CanonicalEncode::to_vec(&list)
}

fn decode_positions(raw: &[u8]) -> Result<BTreeSet<String>, StoreError> {
    let list = Vec::<String>::from_bytes(&Bytes::copy_from_slice(raw))?;
    Ok(list.into_iter().collect())
}
