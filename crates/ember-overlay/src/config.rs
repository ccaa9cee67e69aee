//! Overlay configuration.

use std::time::Duration;

use crate::{
    DEFAULT_DEMOTE_PROBABILITY, DEFAULT_DEMOTE_VIEW_SIZE, DEFAULT_LEASE_CHECK_INTERVAL_SECS,
    DEFAULT_LEASE_SECS, DEFAULT_LOW_CLIENT_COUNT, DEFAULT_MAX_TTL, DEFAULT_PROPAGATE_TTL,
    DEFAULT_WATCHDOG_INTERVAL_SECS,
};

/// Role of the local peer in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Leases from rendezvous peers, never forwards
    Edge,
    /// Grants leases, floods and walks on behalf of others
    Rendezvous,
    /// No leases; reaches peers by local broadcast only
    AdHoc,
}

impl Role {
    /// Parses a role name as used in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "edge" => Some(Role::Edge),
            "rendezvous" | "rdv" => Some(Role::Rendezvous),
            "adhoc" | "ad-hoc" => Some(Role::AdHoc),
            _ => None,
        }
    }

    /// Configuration name of the role.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Edge => "edge",
            Role::Rendezvous => "rendezvous",
            Role::AdHoc => "adhoc",
        }
    }
}

/// Overlay configuration.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Role at startup
    pub initial_role: Role,
    /// Let the watchdog promote and demote the local peer
    pub auto_rendezvous: bool,
    /// Cap applied to every TTL on repropagation
    pub max_ttl: i32,
    /// TTL for messages originated here
    pub default_ttl: i32,
    /// Lease length granted to clients and requested from rendezvous peers
    pub lease_duration: Duration,
    /// Interval between role watchdog evaluations
    pub watchdog_interval: Duration,
    /// Interval between lease expiry and renewal passes
    pub lease_check_interval: Duration,
    /// View size above which demotion is considered
    pub demote_view_size: usize,
    /// Client count below which random demotion applies
    pub low_client_count: usize,
    /// Probability of random demotion
    pub demote_probability: f64,
    /// Capacity of the duplicate suppression ring
    pub seen_capacity: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            initial_role: Role::Edge,
            auto_rendezvous: true,
            max_ttl: DEFAULT_MAX_TTL,
            default_ttl: DEFAULT_PROPAGATE_TTL,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_SECS),
            watchdog_interval: Duration::from_secs(DEFAULT_WATCHDOG_INTERVAL_SECS),
            lease_check_interval: Duration::from_secs(DEFAULT_LEASE_CHECK_INTERVAL_SECS),
            demote_view_size: DEFAULT_DEMOTE_VIEW_SIZE,
            low_client_count: DEFAULT_LOW_CLIENT_COUNT,
            demote_probability: DEFAULT_DEMOTE_PROBABILITY,
            seen_capacity: ember_core::MESSAGE_ID_RING_CAPACITY,
        }
    }
}

impl OverlayConfig {
    /// Creates a configuration starting in `role`.
    pub fn with_role(role: Role) -> Self {
        Self {
            initial_role: role,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names() {
        for role in [Role::Edge, Role::Rendezvous, Role::AdHoc] {
            assert_eq!(Role::from_name(role.name()), Some(role));
        }
        assert_eq!(Role::from_name("RDV"), Some(Role::Rendezvous));
        assert_eq!(Role::from_name("relay"), None);
    }

    #[test]
    fn test_defaults() {
        let config = OverlayConfig::default();
        assert_eq!(config.max_ttl, 200);
        assert_eq!(config.seen_capacity, 1000);
        assert_eq!(config.watchdog_interval, Duration::from_secs(300));
    }
}
