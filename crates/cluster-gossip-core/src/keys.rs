//! Well-known gossip keys

use crate::types::NodeId;

/// Singleton key naming the cluster. Never changes once durably observed.
pub const KEY_CLUSTER_ID: &str = "cluster-id";

/// Singleton liveness marker for the current cluster epoch.
pub const KEY_SENTINEL: &str = "sentinel";

/// Prefix of per-node descriptor keys
pub const KEY_NODE_PREFIX: &str = "node:";

/// Key under which a node publishes its descriptor
pub fn node_key(node_id: NodeId) -> String {
    format!("{KEY_NODE_PREFIX}{}", node_id.0)
}

/// Parse the node id out of a `node:<id>` key
pub fn node_id_from_key(key: &str) -> Option<NodeId> {
    key.strip_prefix(KEY_NODE_PREFIX)?
        .parse::<u32>()
        .ok()
        .filter(|id| *id != 0)
        .map(NodeId)
}

/// Cluster identity keys get pinned once observed
pub fn is_identity_key(key: &str) -> bool {
    key == KEY_CLUSTER_ID || key == KEY_SENTINEL
}
