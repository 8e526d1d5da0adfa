//! Core gossip types
//!
//! All types here are serialized with postcard when they cross the wire.
//! Field order matters for the encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since the UNIX epoch.
pub type Timestamp = i64;

/// Deadline used for infos that never expire.
pub const NO_EXPIRY: Timestamp = i64::MAX;

// =============================================================================
// IDENTITY
// =============================================================================

/// Cluster member identifier. Zero means "not yet known".
#[derive(
    Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Placeholder used before a peer has identified itself
    pub const UNKNOWN: NodeId = NodeId(0);

    pub fn is_known(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// INFO
// =============================================================================

/// A single disseminated fact.
///
/// Infos are only ever replaced wholesale. The stored info for a key is the
/// one with the greatest `(orig_stamp, node_id)` pair.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Info {
    pub key: String,
    pub value: Vec<u8>,
    /// Node that produced this value
    pub node_id: NodeId,
    /// Origin wall time of the write
    pub orig_stamp: Timestamp,
    /// Absolute deadline after which the info is invisible
    pub ttl_stamp: Timestamp,
    /// Number of times the info has been re-propagated
    pub hops: u32,
}

impl Info {
    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.ttl_stamp
    }

    /// Strict freshness order: timestamp first, origin node as tie-break
    pub fn is_fresher_than(&self, other: &Info) -> bool {
        self.freshness() > other.freshness()
    }

    pub fn freshness(&self) -> (Timestamp, NodeId) {
        (self.orig_stamp, self.node_id)
    }

    /// Nanoseconds left before expiry (zero once expired)
    pub fn remaining_ttl(&self, now: Timestamp) -> i64 {
        self.ttl_stamp.saturating_sub(now).max(0)
    }
}

// =============================================================================
// NODE DESCRIPTOR
// =============================================================================

/// Address and attributes of a cluster member, gossiped under `node:<id>`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    /// Advertised gossip address (host:port)
    pub address: String,
    /// Free-form attributes (locality, hardware hints)
    pub attrs: Vec<String>,
    /// When this incarnation of the node started
    pub started_at: Timestamp,
}

impl NodeDescriptor {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(Error::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(Error::from)
    }
}
