//! Storage configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{DEFAULT_GC_INTERVAL_SECS, DEFAULT_INCONVENIENCE_THRESHOLD, DEFAULT_SRDI_GC_INTERVAL_SECS};

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base path for all storage
    pub base_path: PathBuf,
    /// Ceiling between document store GC sweeps
    pub gc_interval: Duration,
    /// Expired-record hits during searches that trigger an early sweep
    pub inconvenience_threshold: u64,
    /// Interval between SRDI local index GC passes
    pub srdi_gc_interval: Duration,
    /// Sync writes to disk
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".ember"),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            inconvenience_threshold: DEFAULT_INCONVENIENCE_THRESHOLD,
            srdi_gc_interval: Duration::from_secs(DEFAULT_SRDI_GC_INTERVAL_SECS),
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with the given base path.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Default::default()
        }
    }

    /// Returns the root directory of a document store area.
    pub fn area_path(&self, area: &str) -> PathBuf {
        self.base_path.join("cm").join(area)
    }

    /// Returns the primary record database of an area.
    pub fn records_path(&self, area: &str) -> PathBuf {
        self.area_path(area).join("records")
    }

    /// Returns the index database (position lists plus one column family
    /// per attribute) of an area.
    pub fn index_path(&self, area: &str) -> PathBuf {
        self.area_path(area).join("index")
    }

    /// Returns the root directory of a named SRDI local index.
    pub fn srdi_path(&self, name: &str) -> PathBuf {
        self.base_path.join("srdi").join(name)
    }

    /// Creates the base directory.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        create_dir(&self.base_path)
    }
}

fn create_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let config = StoreConfig::new("/tmp/ember");
        assert_eq!(
            config.records_path("discovery"),
            PathBuf::from("/tmp/ember/cm/discovery/records")
        );
        assert_eq!(
            config.index_path("discovery"),
            PathBuf::from("/tmp/ember/cm/discovery/index")
        );
        assert_eq!(
            config.srdi_path("discoverySrdi"),
            PathBuf::from("/tmp/ember/srdi/discoverySrdi")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.gc_interval, Duration::from_secs(3600));
        assert_eq!(config.srdi_gc_interval, Duration::from_secs(600));
        assert_eq!(config.inconvenience_threshold, 100);
    }
}
