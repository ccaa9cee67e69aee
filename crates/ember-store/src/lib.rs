//! Ember Store - Local storage engine.
//!
//! Provides:
//! - An expiring document store keyed by (directory, name) with delta tracking
//! - A secondary indexer supporting exact/prefix/suffix/contains queries
//! - The SRDI local index tracking which remote peers claim which entries
//! - Background garbage collection workers

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod document;
pub mod gc;
pub mod indexer;
pub mod query;
pub mod record;
pub mod srdi_index;

pub use config::StoreConfig;
pub use document::{Document, DocumentStore, StoreStats};
pub use indexer::Indexer;
pub use query::QueryPattern;
pub use srdi_index::{SrdiLocalIndex, SrdiPeerEntry, SrdiStats};

use thiserror::Error;

/// Default ceiling between document store GC sweeps (one hour).
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 3600;

/// Default number of expired-but-unpurged hits that triggers an early sweep.
pub const DEFAULT_INCONVENIENCE_THRESHOLD: u64 = 100;

/// Default interval between SRDI local index GC passes (ten minutes).
pub const DEFAULT_SRDI_GC_INTERVAL_SECS: u64 = 600;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RocksDB error
    #[error("Database error: {0}")]
    Database(String),

    /// Encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] ember_core::encoding::DecodeError),

    /// Lifetime must be positive
    #[error("Invalid lifetime: must be greater than zero")]
    InvalidLifetime,

    /// Key component is empty or contains a reserved character
    #[error("Invalid key component: {0:?}")]
    InvalidKey(String),

    /// Missing column family
    #[error("Missing column family: {0}")]
    MissingColumnFamily(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
