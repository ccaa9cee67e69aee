//! Integration and end-to-end tests for Ember.
//!
//! This crate provides:
//! - An in-memory transport connecting overlays inside one process
//! - A multi-node test harness for building rendezvous networks
//! - Integration tests for propagation, role switching and the
//!   distributed index

pub mod harness;
pub mod memory;
pub mod node;

pub use harness::TestNetwork;
pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use node::{TestNode, TestNodeConfig};
