//! Expiring document store.
//!
//! Documents are stored under `(directory, name)` with two timers:
//!
//! - **lifetime**: absolute instant after which the record is gone
//! - **expiration**: how long the record may be advertised to other peers,
//!   never longer than the remaining lifetime
//!
//! Every attribute of a document is indexed under `<dir>:<attr>`, and every
//! shareable save or removal is queued as an [`SrdiEntry`] delta per
//! directory for the index publisher to drain.
//!
//! Expired records are skipped by reads and purged by [`DocumentStore::garbage_collect`].
//! Searches that stumble over expired records count them; once the count
//! passes the configured threshold the GC worker is woken early.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_core::encoding::{CanonicalDecode, CanonicalEncode};
use ember_core::Timestamp;
use ember_proto::SrdiEntry;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::gc::spawn_gc_worker;
use crate::indexer::Indexer;
use crate::query::QueryPattern;
use crate::record::{dir_prefix, index_name, record_key, split_key, StoredRecord};
use crate::StoreError;

/// A document to store: opaque content plus the attributes to index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Document bytes
    pub content: Bytes,
    /// Indexed (attribute, value) pairs
    pub attributes: Vec<(String, String)>,
}

impl Document {
    /// Creates a document with no indexed attributes.
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            attributes: Vec::new(),
        }
    }

    /// Adds an indexed attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}

/// Snapshot of store counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Records on disk, expired or not
    pub records: usize,
    /// Known directories
    pub directories: usize,
    /// Attribute indices
    pub indices: usize,
    /// Deltas queued for publication
    pub pending_deltas: usize,
    /// Expired hits since the last sweep
    pub inconvenience: u64,
}

struct StoreInner {
    records: DB,
    indexer: Indexer,
    deltas: HashMap<String, Vec<SrdiEntry>>,
    dirs: BTreeSet<String>,
    reported_corrupt: HashSet<String>,
}

/// Persistent document store with secondary indices and delta tracking.
pub struct DocumentStore {
    area: String,
    config: StoreConfig,
    inner: Mutex<StoreInner>,
    inconvenience: AtomicU64,
    gc_wakeup: Arc<Notify>,
}

impl DocumentStore {
    /// Opens (or creates) the store for `area` under the configured base path.
    pub fn open(config: &StoreConfig, area: &str) -> Result<Self, StoreError> {
        std::fs::create_dir_all(config.area_path(area))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let records = DB::open(&opts, config.records_path(area))?;
        let indexer = Indexer::open(&config.index_path(area), config.sync_writes)?;

        let mut dirs = BTreeSet::new();
        for item in records.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((dir, _)) = std::str::from_utf8(&key).ok().and_then(split_key) {
                dirs.insert(dir.to_string());
            }
        }

        info!(area, directories = dirs.len(), "Opened document store");

        Ok(Self {
            area: area.to_string(),
            config: config.clone(),
            inner: Mutex::new(StoreInner {
                records,
                indexer,
                deltas: HashMap::new(),
                dirs,
                reported_corrupt: HashSet::new(),
            }),
            inconvenience: AtomicU64::new(0),
            gc_wakeup: Arc::new(Notify::new()),
        })
    }

    /// Name of the storage area.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// Stores (or replaces) a document.
    ///
    /// `lifetime` must be positive; `expiration` is clamped to it. When a
    /// record already exists the later of the two absolute lifetimes wins.
    /// A positive expiration queues one delta per attribute.
    pub fn save(
        &self,
        dir: &str,
        name: &str,
        document: &Document,
        lifetime: Duration,
        expiration: Duration,
    ) -> Result<(), StoreError> {
        if lifetime.is_zero() {
            return Err(StoreError::InvalidLifetime);
        }
        let key = record_key(dir, name)?;
        let indices = document
            .attributes
            .iter()
            .map(|(attr, _)| index_name(dir, attr))
            .collect::<Result<Vec<_>, _>>()?;
        let expiration = expiration.min(lifetime);
        let mut absolute = Timestamp::after(lifetime);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(existing) = read_record(&inner.records, &mut inner.reported_corrupt, &key)? {
            absolute = absolute.max(existing.lifetime);
            for (attr, value) in &existing.attributes {
                inner
                    .indexer
                    .remove_from_index(&index_name(dir, attr)?, value, &key)?;
            }
        }

        let record = StoredRecord {
            lifetime: absolute,
            expiration_ms: u64::try_from(expiration.as_millis()).unwrap_or(u64::MAX),
            content: document.content.clone(),
            attributes: document.attributes.clone(),
        };
        inner
            .records
            .put_opt(key.as_bytes(), record.to_vec(), &self.write_options())?;

        for (index, (_, value)) in indices.iter().zip(&record.attributes) {
            inner.indexer.add_to_index(index, value, &key)?;
        }
        inner.dirs.insert(dir.to_string());
        inner.reported_corrupt.remove(&key);

        if !expiration.is_zero() && !record.attributes.is_empty() {
            inner.deltas.entry(dir.to_string()).or_default().extend(
                record
                    .attributes
                    .iter()
                    .map(|(attr, value)| SrdiEntry::new(attr.clone(), value.clone(), expiration)),
            );
        }

        debug!(area = %self.area, key = %key, lifetime = %absolute, "Saved document");
        Ok(())
    }

    /// Deletes a document. Returns false if it did not exist.
    ///
    /// Removing a record that was still shareable queues zero-expiration
    /// deltas so that remote indices drop it.
    pub fn remove(&self, dir: &str, name: &str) -> Result<bool, StoreError> {
        let key = record_key(dir, name)?;
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let record = read_record(&inner.records, &mut inner.reported_corrupt, &key)?;
        inner
            .records
            .delete_opt(key.as_bytes(), &self.write_options())?;

        let Some(record) = record else {
            return Ok(false);
        };

        for (attr, value) in &record.attributes {
            inner
                .indexer
                .remove_from_index(&index_name(dir, attr)?, value, &key)?;
        }

        if record.expiration_time(now).is_some() && !record.attributes.is_empty() {
            inner.deltas.entry(dir.to_string()).or_default().extend(
                record
                    .attributes
                    .iter()
                    .map(|(attr, value)| SrdiEntry::new(attr.clone(), value.clone(), Duration::ZERO)),
            );
        }

        debug!(area = %self.area, key = %key, "Removed document");
        Ok(true)
    }

    /// Returns the content of a live document.
    pub fn restore(&self, dir: &str, name: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .live_record(dir, name)?
            .map(|(record, _)| record.content))
    }

    /// Returns true if a live document exists.
    pub fn contains(&self, dir: &str, name: &str) -> Result<bool, StoreError> {
        Ok(self.live_record(dir, name)?.is_some())
    }

    /// Remaining lifetime of a document.
    pub fn lifetime(&self, dir: &str, name: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self
            .live_record(dir, name)?
            .and_then(|(record, now)| record.remaining_lifetime(now)))
    }

    /// Remaining shareable span of a document.
    pub fn expiration_time(&self, dir: &str, name: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self
            .live_record(dir, name)?
            .and_then(|(record, now)| record.expiration_time(now)))
    }

    /// Returns up to `threshold` live documents of `dir` as `(name, content)`.
    ///
    /// With `purge`, expired records met along the way are deleted.
    pub fn get_records(
        &self,
        dir: &str,
        threshold: usize,
        purge: bool,
    ) -> Result<Vec<(String, Bytes)>, StoreError> {
        let prefix = dir_prefix(dir)?;
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (live, expired) = inner.scan_dir(&prefix, now, threshold, purge);
        if purge && !expired.is_empty() {
            let removed = inner.delete_records(&expired, &self.write_options())?;
            debug!(area = %self.area, dir, removed, "Purged expired records");
        }

        Ok(live
            .into_iter()
            .map(|(key, record)| (key[prefix.len()..].to_string(), record.content))
            .collect())
    }

    /// Finds live documents of `dir` whose `attribute` matches `pattern`.
    ///
    /// See [`QueryPattern::parse`] for the pattern syntax.
    pub fn search(
        &self,
        dir: &str,
        attribute: &str,
        pattern: &str,
        threshold: usize,
    ) -> Result<Vec<(String, Bytes)>, StoreError> {
        self.search_pattern(dir, attribute, &QueryPattern::parse(pattern), threshold)
    }

    /// Like [`DocumentStore::search`] with an already-built pattern.
    pub fn search_pattern(
        &self,
        dir: &str,
        attribute: &str,
        pattern: &QueryPattern,
        threshold: usize,
    ) -> Result<Vec<(String, Bytes)>, StoreError> {
        let prefix = dir_prefix(dir)?;
        let index = index_name(dir, attribute)?;
        if threshold == 0 {
            return Ok(Vec::new());
        }
        let now = Timestamp::now();

        let mut results = Vec::new();
        let mut expired_hits = 0u64;
        {
            let mut guard = self.inner.lock();
            let StoreInner {
                records,
                indexer,
                reported_corrupt,
                ..
            } = &mut *guard;

            let mut seen = HashSet::new();
            indexer.search(&index, pattern, |_, positions| {
                for key in positions {
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    let Some(name) = key.strip_prefix(prefix.as_str()) else {
                        continue;
                    };
                    match read_record(records, reported_corrupt, &key) {
                        Ok(Some(record)) if !record.is_expired(now) => {
                            results.push((name.to_string(), record.content));
                        }
                        Ok(Some(_)) => expired_hits += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = %key, error = %e, "Skipping unreadable record");
                        }
                    }
                    if results.len() >= threshold {
                        return false;
                    }
                }
                true
            })?;
        }

        self.note_inconvenience(expired_hits);
        Ok(results)
    }

    /// Snapshot of every shareable attribute of `dir`, each with its
    /// remaining expiration. With `clear_deltas`, pending deltas for the
    /// directory are discarded since the snapshot supersedes them.
    pub fn entries(&self, dir: &str, clear_deltas: bool) -> Result<Vec<SrdiEntry>, StoreError> {
        let prefix = dir_prefix(dir)?;
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (live, _) = inner.scan_dir(&prefix, now, usize::MAX, false);
        if clear_deltas {
            inner.deltas.remove(dir);
        }

        let mut entries = Vec::new();
        for (_, record) in live {
            if let Some(expiration) = record.expiration_time(now) {
                entries.extend(
                    record
                        .attributes
                        .into_iter()
                        .map(|(attr, value)| SrdiEntry::new(attr, value, expiration)),
                );
            }
        }
        Ok(entries)
    }

    /// Drains the deltas queued for `dir`.
    pub fn take_deltas(&self, dir: &str) -> Vec<SrdiEntry> {
        self.inner.lock().deltas.remove(dir).unwrap_or_default()
    }

    /// Directories holding records or pending deltas.
    pub fn directories(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut dirs = inner.dirs.clone();
        dirs.extend(inner.deltas.keys().cloned());
        dirs.into_iter().collect()
    }

    /// Deletes every expired record and its index positions. Returns the
    /// number of records removed and resets the inconvenience counter.
    pub fn garbage_collect(&self) -> Result<usize, StoreError> {
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut stale = Vec::new();
        let mut empty_dirs = Vec::new();
        for dir in inner.dirs.clone() {
            let prefix = dir_prefix(&dir)?;
            let (live, expired) = inner.scan_dir(&prefix, now, 1, true);
            if live.is_empty() {
                empty_dirs.push(dir);
            }
            stale.extend(expired);
        }

        let removed = inner.delete_records(&stale, &self.write_options())?;
        for dir in empty_dirs {
            inner.dirs.remove(&dir);
        }
        drop(guard);

        self.inconvenience.store(0, Ordering::Relaxed);
        if removed > 0 {
            info!(area = %self.area, removed, "Garbage collected expired records");
        }
        Ok(removed)
    }

    /// Rebuilds every attribute index from the live records. Returns the
    /// number of records indexed.
    pub fn rebuild_index(&self) -> Result<usize, StoreError> {
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut live = Vec::new();
        for item in inner.records.iterator(IteratorMode::Start) {
            let (raw_key, raw) = item?;
            let Ok(key) = std::str::from_utf8(&raw_key) else {
                continue;
            };
            match decode_record(&raw) {
                Some(record) if !record.is_expired(now) => live.push((key.to_string(), record)),
                Some(_) => {}
                None => {
                    if inner.reported_corrupt.insert(key.to_string()) {
                        warn!(area = %self.area, key, "Skipping corrupt record");
                    }
                }
            }
        }

        inner.indexer.clear()?;
        for (key, record) in &live {
            let Some((dir, _)) = split_key(key) else {
                continue;
            };
            for (attr, value) in &record.attributes {
                let Ok(index) = index_name(dir, attr) else {
                    warn!(area = %self.area, key = %key, attr = %attr, "Skipping unindexable attribute");
                    continue;
                };
                inner.indexer.add_to_index(&index, value, key)?;
            }
        }

        info!(area = %self.area, records = live.len(), "Rebuilt attribute indices");
        Ok(live.len())
    }

    /// Returns store counters.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            records: inner.records.iterator(IteratorMode::Start).count(),
            directories: inner.dirs.len(),
            indices: inner.indexer.index_names().count(),
            pending_deltas: inner.deltas.values().map(Vec::len).sum(),
            inconvenience: self.inconvenience.load(Ordering::Relaxed),
        }
    }

    /// Starts the GC worker: sweeps on the configured interval, or early
    /// once searches have hit more expired records than the threshold.
    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        spawn_gc_worker(
            "documents",
            self.config.gc_interval,
            Some(Arc::clone(&self.gc_wakeup)),
            cancel,
            move || store.garbage_collect(),
        )
    }

    fn live_record(
        &self,
        dir: &str,
        name: &str,
    ) -> Result<Option<(StoredRecord, Timestamp)>, StoreError> {
        let key = record_key(dir, name)?;
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        Ok(read_record(&inner.records, &mut inner.reported_corrupt, &key)?
            .filter(|record| !record.is_expired(now))
            .map(|record| (record, now)))
    }

    fn note_inconvenience(&self, hits: u64) {
        if hits == 0 {
            return;
        }
        let total = self.inconvenience.fetch_add(hits, Ordering::Relaxed) + hits;
        if total > self.config.inconvenience_threshold {
            debug!(area = %self.area, total, "Inconvenience threshold passed");
            self.gc_wakeup.notify_one();
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl StoreInner {
    /// Walks the records of one directory. Collects live records until
    /// `limit` is reached, and expired keys too when `with_expired` is set.
    /// A read error ends the walk with whatever was collected so far.
    fn scan_dir(
        &mut self,
        prefix: &str,
        now: Timestamp,
        limit: usize,
        with_expired: bool,
    ) -> (Vec<(String, StoredRecord)>, Vec<String>) {
        let mut live = Vec::new();
        let mut expired = Vec::new();

        let mode = IteratorMode::From(prefix.as_bytes(), Direction::Forward);
        for item in self.records.iterator(mode) {
            let (raw_key, raw) = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(prefix, error = %e, "Record scan interrupted");
                    break;
                }
            };
            if !raw_key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Ok(key) = std::str::from_utf8(&raw_key) else {
                continue;
            };

            match decode_record(&raw) {
                Some(record) if record.is_expired(now) => {
                    if with_expired {
                        expired.push(key.to_string());
                    }
                }
                Some(record) => {
                    if live.len() < limit {
                        live.push((key.to_string(), record));
                    } else if !with_expired {
                        break;
                    }
                }
                None => {
                    if self.reported_corrupt.insert(key.to_string()) {
                        warn!(key, "Skipping corrupt record");
                    }
                }
            }
        }
        (live, expired)
    }

    /// Deletes records and purges their index positions.
    fn delete_records(&mut self, keys: &[String], opts: &WriteOptions) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete(key.as_bytes());
        }
        self.records.write_opt(batch, opts)?;

        let stale: HashSet<String> = keys.iter().cloned().collect();
        self.indexer.purge(&stale)?;
        Ok(keys.len())
    }
}

fn decode_record(raw: &[u8]) -> Option<StoredRecord> {
    StoredRecord::from_bytes(raw).ok()
}

fn read_record(
    records: &DB,
    reported_corrupt: &mut HashSet<String>,
    key: &str,
) -> Result<Option<StoredRecord>, StoreError> {
    let Some(raw) = records.get(key.as_bytes())? else {
        return Ok(None);
    };
    match decode_record(&raw) {
        Some(record) => Ok(Some(record)),
        None => {
            if reported_corrupt.insert(key.to_string()) {
                warn!(key, "Skipping corrupt record");
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn open() -> (TempDir, DocumentStore) {
        let dir = TempDir::new().unwrap();
        let store = DocumentStore::open(&StoreConfig::new(dir.path()), "discovery").unwrap();
        (dir, store)
    }

    fn peer_doc(name: &str) -> Document {
        Document::new(format!("<peer>{}</peer>", name)).with_attribute("Name", name)
    }

    fn names(results: &[(String, Bytes)]) -> Vec<&str> {
        let mut names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_save_and_restore() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();

        assert_eq!(
            store.restore("Peers", "p1").unwrap(),
            Some(Bytes::from("<peer>alpha</peer>"))
        );
        assert!(store.contains("Peers", "p1").unwrap());
        assert!(store.restore("Peers", "p2").unwrap().is_none());
        assert!(store.restore("Groups", "p1").unwrap().is_none());
    }

    #[test]
    fn test_zero_lifetime_rejected() {
        let (_dir, store) = open();
        let err = store
            .save("Peers", "p1", &peer_doc("alpha"), Duration::ZERO, HOUR)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidLifetime));
        assert!(!store.contains("Peers", "p1").unwrap());
    }

    #[test]
    fn test_expiration_clamped_to_lifetime() {
        let (_dir, store) = open();
        store
            .save("Peers", "p1", &peer_doc("alpha"), Duration::from_secs(60), HOUR)
            .unwrap();

        let lifetime = store.lifetime("Peers", "p1").unwrap().unwrap();
        let expiration = store.expiration_time("Peers", "p1").unwrap().unwrap();
        assert!(lifetime <= Duration::from_secs(60));
        assert!(expiration <= lifetime);

        let deltas = store.take_deltas("Peers");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].expiration(), Duration::from_secs(60));
    }

    #[test]
    fn test_resave_keeps_longer_lifetime() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store
            .save("Peers", "p1", &peer_doc("alpha"), Duration::from_secs(5), Duration::ZERO)
            .unwrap();

        let lifetime = store.lifetime("Peers", "p1").unwrap().unwrap();
        assert!(lifetime > Duration::from_secs(3000));
    }

    #[test]
    fn test_resave_reindexes_attributes() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store.save("Peers", "p1", &peer_doc("beta"), HOUR, HOUR).unwrap();

        assert!(store.search("Peers", "Name", "alpha", 10).unwrap().is_empty());
        assert_eq!(names(&store.search("Peers", "Name", "beta", 10).unwrap()), vec!["p1"]);
    }

    #[test]
    fn test_search_patterns_and_threshold() {
        let (_dir, store) = open();
        for (name, value) in [("p1", "alpha"), ("p2", "alpine"), ("p3", "beta"), ("p4", "delta")] {
            store.save("Peers", name, &peer_doc(value), HOUR, HOUR).unwrap();
        }

        assert_eq!(names(&store.search("Peers", "Name", "al*", 10).unwrap()), vec!["p1", "p2"]);
        assert_eq!(names(&store.search("Peers", "Name", "*ta", 10).unwrap()), vec!["p3", "p4"]);
        assert_eq!(names(&store.search("Peers", "Name", "*lp*", 10).unwrap()), vec!["p1", "p2"]);
        assert_eq!(store.search("Peers", "Name", "*", 2).unwrap().len(), 2);
        assert!(store.search("Peers", "Name", "*", 0).unwrap().is_empty());
        assert!(store.search("Peers", "Missing", "*", 10).unwrap().is_empty());

        let negated = store
            .search_pattern("Peers", "Name", &QueryPattern::parse("al*").negate(), 10)
            .unwrap();
        assert_eq!(names(&negated), vec!["p3", "p4"]);
    }

    #[test]
    fn test_colliding_index_names_rejected() {
        let (_dir, store) = open();
        let doc = Document::new("n").with_attribute("b:c", "v");
        let err = store.save("a", "n1", &doc, HOUR, HOUR).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));

        let doc = Document::new("n").with_attribute("c", "v");
        let err = store.save("a:b", "n2", &doc, HOUR, HOUR).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));

        assert!(!store.contains("a", "n1").unwrap());
        assert!(store.take_deltas("a").is_empty());
        assert!(store.search("a", "b:c", "v", 10).is_err());
        assert!(store.search("a:b", "c", "v", 10).is_err());
    }

    #[test]
    fn test_corrupt_record_skipped_by_reads() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store.save("Peers", "p2", &peer_doc("alpine"), HOUR, HOUR).unwrap();
        store
            .inner
            .lock()
            .records
            .put(b"Peers/p2", b"garbage")
            .unwrap();

        assert_eq!(names(&store.search("Peers", "Name", "al*", 10).unwrap()), vec!["p1"]);
        assert_eq!(names(&store.get_records("Peers", 10, false).unwrap()), vec!["p1"]);
        let entries = store.entries("Peers", false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, "alpha");
        assert!(store.inner.lock().reported_corrupt.contains("Peers/p2"));
    }

    #[test]
    fn test_expired_records_hidden_and_collected() {
        let (_dir, store) = open();
        store
            .save("Peers", "short", &peer_doc("alpha"), Duration::from_millis(50), HOUR)
            .unwrap();
        store.save("Peers", "long", &peer_doc("alpha"), HOUR, HOUR).unwrap();

        std::thread::sleep(Duration::from_millis(120));

        assert!(store.restore("Peers", "short").unwrap().is_none());
        assert_eq!(names(&store.search("Peers", "Name", "alpha", 10).unwrap()), vec!["long"]);
        assert_eq!(store.stats().inconvenience, 1);
        assert_eq!(names(&store.get_records("Peers", 10, false).unwrap()), vec!["long"]);

        assert_eq!(store.garbage_collect().unwrap(), 1);
        let stats = store.stats();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.inconvenience, 0);
        assert_eq!(names(&store.search("Peers", "Name", "alpha", 10).unwrap()), vec!["long"]);
    }

    #[test]
    fn test_get_records_purge() {
        let (_dir, store) = open();
        store
            .save("Peers", "short", &peer_doc("alpha"), Duration::from_millis(50), HOUR)
            .unwrap();
        store.save("Peers", "long", &peer_doc("beta"), HOUR, HOUR).unwrap();
        std::thread::sleep(Duration::from_millis(120));

        assert_eq!(names(&store.get_records("Peers", 10, true).unwrap()), vec!["long"]);
        assert_eq!(store.stats().records, 1);
    }

    #[test]
    fn test_deltas() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store
            .save("Peers", "p2", &peer_doc("beta"), HOUR, Duration::ZERO)
            .unwrap();

        let deltas = store.take_deltas("Peers");
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].value, "alpha");
        assert!(store.take_deltas("Peers").is_empty());

        assert!(store.remove("Peers", "p1").unwrap());
        let deltas = store.take_deltas("Peers");
        assert_eq!(deltas.len(), 1);
        assert!(deltas[0].is_tombstone());

        assert!(!store.remove("Peers", "p1").unwrap());
        assert!(store.search("Peers", "Name", "alpha", 10).unwrap().is_empty());
    }

    #[test]
    fn test_remove_unshareable_emits_nothing() {
        let (_dir, store) = open();
        store
            .save("Peers", "p1", &peer_doc("alpha"), HOUR, Duration::ZERO)
            .unwrap();
        assert!(store.remove("Peers", "p1").unwrap());
        assert!(store.take_deltas("Peers").is_empty());
    }

    #[test]
    fn test_entries_snapshot() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store
            .save("Peers", "p2", &peer_doc("beta"), HOUR, Duration::ZERO)
            .unwrap();

        let entries = store.entries("Peers", true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "Name");
        assert_eq!(entries[0].value, "alpha");
        assert!(store.take_deltas("Peers").is_empty());
        assert_eq!(store.directories(), vec!["Peers".to_string()]);
    }

    #[test]
    fn test_rebuild_index() {
        let (_dir, store) = open();
        store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        store.save("Groups", "g1", &peer_doc("alpha"), HOUR, HOUR).unwrap();

        assert_eq!(store.rebuild_index().unwrap(), 2);
        assert_eq!(names(&store.search("Peers", "Name", "alpha", 10).unwrap()), vec!["p1"]);
        assert_eq!(names(&store.search("Groups", "Name", "alpha", 10).unwrap()), vec!["g1"]);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new(dir.path());
        {
            let store = DocumentStore::open(&config, "discovery").unwrap();
            store.save("Peers", "p1", &peer_doc("alpha"), HOUR, HOUR).unwrap();
        }
        let store = DocumentStore::open(&config, "discovery").unwrap();
        assert!(store.contains("Peers", "p1").unwrap());
        assert_eq!(store.directories(), vec!["Peers".to_string()]);
        assert_eq!(names(&store.search("Peers", "Name", "alpha", 10).unwrap()), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_inconvenience_wakes_gc() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::new(dir.path());
        config.inconvenience_threshold = 0;
        let store = Arc::new(DocumentStore::open(&config, "discovery").unwrap());

        let cancel = CancellationToken::new();
        let handle = store.spawn_gc(cancel.clone());

        store
            .save("Peers", "short", &peer_doc("alpha"), Duration::from_millis(20), HOUR)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.search("Peers", "Name", "alpha", 10).unwrap().is_empty());

        for _ in 0..200 {
            if store.stats().records == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.stats().records, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
