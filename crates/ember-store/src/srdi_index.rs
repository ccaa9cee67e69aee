//! SRDI local index.
//!
//! Records which remote peers advertise which `(primary key, attribute,
//! value)` triples, each claim with its own absolute expiration. Entries
//! live under the composite key `pk\0attr\0value`; values are indexed per
//! `pk:attr` so that queries accept the same patterns as document searches.
//!
//! The index is soft state: it is wiped when opened and rebuilt from
//! incoming pushes. Peers removed with [`SrdiLocalIndex::remove`] are hidden
//! from queries at once and physically dropped by the next GC pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ember_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use ember_core::{PeerId, Timestamp};
use parking_lot::Mutex;
use rocksdb::{IteratorMode, Options, WriteOptions, DB};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::gc::spawn_gc_worker;
use crate::indexer::Indexer;
use crate::query::QueryPattern;
use crate::record::{index_name, index_prefix};
use crate::StoreError;

const COMPOSITE_SEPARATOR: char = '\0';

/// One peer's claim on an index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrdiPeerEntry {
    /// Advertising peer
    pub peer_id: PeerId,
    /// Absolute instant the claim lapses
    pub expiration: Timestamp,
}

impl CanonicalEncode for SrdiPeerEntry {
    fn encode(&self, buf: &mut BytesMut) {
        self.peer_id.encode(buf);
        self.expiration.encode(buf);
    }
}

impl CanonicalDecode for SrdiPeerEntry {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            peer_id: PeerId::decode(buf)?,
            expiration: Timestamp::decode(buf)?,
        })
    }
}

/// Snapshot of index counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrdiStats {
    /// Distinct composite keys
    pub keys: usize,
    /// Peer claims across all keys
    pub claims: usize,
    /// Peers awaiting garbage collection
    pub pending_garbage: usize,
}

struct SrdiInner {
    db: DB,
    indexer: Indexer,
    sync: bool,
}

/// Index of remote peers advertising entries.
pub struct SrdiLocalIndex {
    name: String,
    gc_interval: Duration,
    inner: Mutex<SrdiInner>,
    garbage: Mutex<HashSet<PeerId>>,
}

impl SrdiLocalIndex {
    /// Opens the index `name`, discarding whatever a previous run left.
    pub fn open(config: &StoreConfig, name: &str) -> Result<Self, StoreError> {
        let root = config.srdi_path(name);
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, root.join("entries"))?;
        let indexer = Indexer::open(&root.join("index"), config.sync_writes)?;

        info!(index = name, path = %root.display(), "Opened SRDI index");

        Ok(Self {
            name: name.to_string(),
            gc_interval: config.srdi_gc_interval,
            inner: Mutex::new(SrdiInner {
                db,
                indexer,
                sync: config.sync_writes,
            }),
            garbage: Mutex::new(HashSet::new()),
        })
    }

    /// Index name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records that `peer` advertises `(pk, attr, value)` for `expiration`.
    ///
    /// Replaces any earlier claim by the same peer. A zero expiration
    /// withdraws the claim.
    pub fn add(
        &self,
        pk: &str,
        attr: &str,
        value: &str,
        peer: PeerId,
        expiration: Duration,
    ) -> Result<(), StoreError> {
        let key = composite_key(pk, attr, value)?;
        let now = Timestamp::now();

        self.garbage.lock().remove(&peer);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut claims = inner.load(&key)?;
        claims.retain(|c| c.peer_id != peer && !c.expiration.has_passed(now));
        if !expiration.is_zero() {
            claims.push(SrdiPeerEntry {
                peer_id: peer,
                expiration: now.add(expiration),
            });
        }
        inner.store(pk, attr, value, &key, &claims)
    }

    /// Returns up to `threshold` distinct live peers advertising a value of
    /// `attr` under `pk` that matches `value`.
    ///
    /// Without `attr`, every attribute of `pk` is searched and `value` is
    /// ignored. Without `value`, every value matches.
    pub fn query(
        &self,
        pk: &str,
        attr: Option<&str>,
        value: Option<&str>,
        threshold: usize,
    ) -> Result<Vec<PeerId>, StoreError> {
        if threshold == 0 {
            return Ok(Vec::new());
        }
        let pattern = match (attr, value) {
            (Some(_), Some(value)) => QueryPattern::parse(value),
            _ => QueryPattern::Any,
        };
        let garbage = self.garbage.lock().clone();
        let now = Timestamp::now();

        let inner = self.inner.lock();
        let index_names: Vec<String> = match attr {
            Some(attr) => vec![index_name(pk, attr)?],
            None => {
                let prefix = index_prefix(pk)?;
                inner
                    .indexer
                    .index_names()
                    .filter(|n| n.starts_with(&prefix))
                    .map(String::from)
                    .collect()
            }
        };

        let mut results = Vec::new();
        let mut seen = HashSet::new();

        for name in &index_names {
            inner.indexer.search(name, &pattern, |_, positions| {
                for key in positions {
                    let claims = match load_claims(&inner.db, &key) {
                        Ok(claims) => claims,
                        Err(e) => {
                            warn!(
                                index = %self.name,
                                key = %key.escape_debug(),
                                error = %e,
                                "Skipping unreadable SRDI entry"
                            );
                            continue;
                        }
                    };
                    for claim in claims {
                        if claim.expiration.has_passed(now) || garbage.contains(&claim.peer_id) {
                            continue;
                        }
                        if seen.insert(claim.peer_id) {
                            results.push(claim.peer_id);
                            if results.len() >= threshold {
                                return false;
                            }
                        }
                    }
                }
                true
            })?;

            if results.len() >= threshold {
                break;
            }
        }

        Ok(results)
    }

    /// Live claims on one exact triple.
    pub fn get_record(
        &self,
        pk: &str,
        attr: &str,
        value: &str,
    ) -> Result<Vec<SrdiPeerEntry>, StoreError> {
        let key = composite_key(pk, attr, value)?;
        let garbage = self.garbage.lock().clone();
        let now = Timestamp::now();

        let inner = self.inner.lock();
        let mut claims = load_claims(&inner.db, &key)?;
        claims.retain(|c| !c.expiration.has_passed(now) && !garbage.contains(&c.peer_id));
        Ok(claims)
    }

    /// Hides every claim made by `peer`. Storage is reclaimed by the next
    /// [`SrdiLocalIndex::garbage_collect`].
    pub fn remove(&self, peer: &PeerId) {
        if self.garbage.lock().insert(*peer) {
            debug!(index = %self.name, peer = %peer, "Marked peer for removal");
        }
    }

    /// Drops expired claims and claims by removed peers. Returns the number
    /// of claims dropped.
    pub fn garbage_collect(&self) -> Result<usize, StoreError> {
        let garbage = self.garbage.lock().clone();
        let now = Timestamp::now();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut updates = Vec::new();
        let mut dropped = 0;
        for item in inner.db.iterator(IteratorMode::Start) {
            let (raw_key, raw) = item?;
            let Ok(key) = std::str::from_utf8(&raw_key) else {
                continue;
            };
            let mut claims = decode_claims(key, &raw);
            let before = claims.len();
            claims.retain(|c| !c.expiration.has_passed(now) && !garbage.contains(&c.peer_id));
            if claims.len() != before || before == 0 {
                dropped += before - claims.len();
                updates.push((key.to_string(), claims));
            }
        }

        for (key, claims) in updates {
            if let Some((pk, attr, value)) = split_composite(&key) {
                inner.store(pk, attr, value, &key, &claims)?;
            }
        }
        drop(guard);

        self.garbage.lock().retain(|p| !garbage.contains(p));
        if dropped > 0 {
            info!(index = %self.name, dropped, "Garbage collected SRDI claims");
        }
        Ok(dropped)
    }

    /// Returns index counters.
    pub fn stats(&self) -> SrdiStats {
        let pending_garbage = self.garbage.lock().len();
        let inner = self.inner.lock();
        let mut stats = SrdiStats {
            pending_garbage,
            ..Default::default()
        };
        for (raw_key, raw) in inner.db.iterator(IteratorMode::Start).flatten() {
            stats.keys += 1;
            stats.claims += decode_claims(&String::from_utf8_lossy(&raw_key), &raw).len();
        }
        stats
    }

    /// Starts the periodic GC worker.
    pub fn spawn_gc(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let index = Arc::clone(self);
        spawn_gc_worker("srdi", self.gc_interval, None, cancel, move || {
            index.garbage_collect()
        })
    }
}

impl SrdiInner {
    fn load(&self, key: &str) -> Result<Vec<SrdiPeerEntry>, StoreError> {
        load_claims(&self.db, key)
    }

    /// Persists the claims on a triple, deleting the key and its index
    /// position once no claim is left.
    fn store(
        &mut self,
        pk: &str,
        attr: &str,
        value: &str,
        key: &str,
        claims: &[SrdiPeerEntry],
    ) -> Result<(), StoreError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync);

        let index = index_name(pk, attr)?;
        if claims.is_empty() {
            self.db.delete_opt(key.as_bytes(), &opts)?;
            self.indexer.remove_from_index(&index, value, key)?;
        } else {
            self.db
                .put_opt(key.as_bytes(), CanonicalEncode::to_vec(&claims.to_vec()), &opts)?;
            self.indexer.add_to_index(&index, value, key)?;
        }
        Ok(())
    }
}

fn composite_key(pk: &str, attr: &str, value: &str) -> Result<String, StoreError> {
    // Parts valid in an index name never hold the composite separator.
    index_name(pk, attr)?;
    Ok(format!(
        "{}{}{}{}{}",
        pk, COMPOSITE_SEPARATOR, attr, COMPOSITE_SEPARATOR, value
    ))
}

fn split_composite(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, COMPOSITE_SEPARATOR);
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn load_claims(db: &DB, key: &str) -> Result<Vec<SrdiPeerEntry>, StoreError> {
    Ok(db
        .get(key.as_bytes())?
        .map(|raw| decode_claims(key, &raw))
        .unwrap_or_default())
}

fn decode_claims(key: &str, raw: &[u8]) -> Vec<SrdiPeerEntry> {
    match Vec::<SrdiPeerEntry>::from_bytes(raw) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(key = %key.escape_debug(), error = %e, "Dropping corrupt SRDI entry");
            Vec::new()
        }
    }
}
