//! Coordinator configuration.

use std::time::Duration;

use crate::{
    DEFAULT_FORWARD_THRESHOLD, DEFAULT_MAX_HOP_COUNT, DEFAULT_MEMBERSHIP_WAIT_SECS,
    DEFAULT_PUSH_INTERVAL_SECS, DEFAULT_REPLICATION_THRESHOLD,
};

/// Index coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Handler name, carried as the service parameter of index messages
    pub handler_name: String,
    /// Interval between delta pushes
    pub push_interval: Duration,
    /// Poll interval while waiting for a rendezvous connection
    pub membership_wait_interval: Duration,
    /// Minimum view size for replica placement
    pub replication_threshold: usize,
    /// Forwarding hops after which a query is dropped
    pub max_hop_count: u32,
    /// Peers an unanswered inbound query is passed on to
    pub forward_threshold: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handler_name: "index".to_string(),
            push_interval: Duration::from_secs(DEFAULT_PUSH_INTERVAL_SECS),
            membership_wait_interval: Duration::from_secs(DEFAULT_MEMBERSHIP_WAIT_SECS),
            replication_threshold: DEFAULT_REPLICATION_THRESHOLD,
            max_hop_count: DEFAULT_MAX_HOP_COUNT,
            forward_threshold: DEFAULT_FORWARD_THRESHOLD,
        }
    }
}

impl CoordinatorConfig {
    /// Default configuration for a named handler.
    pub fn new(handler_name: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
            ..Default::default()
        }
    }
}
