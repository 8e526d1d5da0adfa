//! Cluster Gossip Core Library
//!
//! This crate provides the data model of the cluster gossip network: the
//! versioned info record, the per-node info store with its freshness merge
//! rule, and the well-known keys the rest of a node watches.
//!
//! # Modules
//!
//! - [`types`]: Core types (NodeId, Info, NodeDescriptor)
//! - [`info_store`]: Versioned key/value store with TTL, hops and identity pinning
//! - [`keys`]: Well-known keys (cluster id, sentinel, node descriptors)
//! - [`clock`]: Wall clock abstraction
//! - [`error`]: Error types

pub mod clock;
pub mod error;
pub mod info_store;
pub mod keys;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use info_store::{Delta, InfoStore, MergeOutcome, PutOutcome};
pub use types::*;
