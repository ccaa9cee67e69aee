//! Push callback between the coordinator and the service owning the data.

use std::sync::{Arc, Weak};

use ember_store::DocumentStore;
use tracing::{debug, warn};

use crate::coordinator::IndexCoordinator;

/// Supplies index entries when the push worker asks for them.
pub trait SrdiPublisher: Send + Sync {
    /// Pushes the full snapshot when `all` is set, else pending deltas.
    fn push_entries(&self, all: bool);
}

/// Publishes the shareable entries of a [`DocumentStore`], one primary key
/// per directory.
pub struct StorePublisher {
    store: Arc<DocumentStore>,
    coordinator: Weak<IndexCoordinator>,
}

impl StorePublisher {
    /// Creates a publisher pushing `store` through `coordinator`.
    pub fn new(store: Arc<DocumentStore>, coordinator: &Arc<IndexCoordinator>) -> Self {
        Self {
            store,
            coordinator: Arc::downgrade(coordinator),
        }
    }
}

impl SrdiPublisher for StorePublisher {
    fn push_entries(&self, all: bool) {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return;
        };

        for dir in self.store.directories() {
            let entries = if all {
                match self.store.entries(&dir, true) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(area = %self.store.area(), dir = %dir, error = %e, "Failed to snapshot entries");
                        continue;
                    }
                }
            } else {
                self.store.take_deltas(&dir)
            };
            if entries.is_empty() {
                continue;
            }
            let count = entries.len();
            let sent = coordinator.push_srdi(&dir, entries);
            debug!(dir = %dir, entries = count, sent, all, "Pushed index entries");
        }
    }
}
