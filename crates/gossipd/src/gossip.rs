//! Local gossip facade
//!
//! [`Gossip`] is the handle the rest of the node uses to read, write and
//! watch disseminated state. It owns the [`InfoStore`] behind a short-held
//! lock. Change callbacks run on a dispatcher task after the lock is
//! released, so a callback may call back into the facade.

use cluster_gossip_core::keys::{is_identity_key, node_id_from_key, KEY_NODE_PREFIX};
use cluster_gossip_core::{
    Clock, Delta, Info, InfoStore, MergeOutcome, NodeDescriptor, NodeId, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// Facade errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Store error: {0}")]
    Core(#[from] cluster_gossip_core::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Callback invoked with the key and new value of a changed info
pub type Callback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Keys a subscription is interested in
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
}

impl KeyPattern {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    pattern: KeyPattern,
    callback: Callback,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: BTreeMap<SubscriptionId, Subscription>,
}

impl Subscribers {
    fn matching(&self, key: &str) -> Vec<Callback> {
        self.entries
            .values()
            .filter(|sub| sub.pattern.matches(key))
            .map(|sub| sub.callback.clone())
            .collect()
    }
}

/// A committed change awaiting delivery
#[derive(Debug)]
struct Change {
    key: String,
    value: Vec<u8>,
}

/// Tally of one merged batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: usize,
    pub stale: usize,
    pub expired: usize,
    pub hop_limited: usize,
    pub conflicts: usize,
    pub invalid: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Stale => self.stale += 1,
            MergeOutcome::Expired => self.expired += 1,
            MergeOutcome::HopLimit => self.hop_limited += 1,
            MergeOutcome::Conflict => self.conflicts += 1,
            MergeOutcome::Invalid => self.invalid += 1,
        }
    }
}

/// A cluster member known through its gossiped descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnownNode {
    pub descriptor: NodeDescriptor,
    /// Hops the descriptor travelled to reach us
    pub hops: u32,
}

/// Snapshot of the whole store for diagnostics
#[derive(Clone, Debug, Serialize)]
pub struct InfoStatus {
    pub node_id: NodeId,
    pub infos: BTreeMap<String, InfoEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InfoEntry {
    /// Hex-encoded value
    pub value: String,
    pub orig_stamp: Timestamp,
    pub node_id: NodeId,
    pub ttl_stamp: Timestamp,
    pub hops: u32,
}

/// Shared gossip state of one node
pub struct Gossip {
    node_id: NodeId,
    store: RwLock<InfoStore>,
    subscribers: Arc<RwLock<Subscribers>>,
    changes_tx: mpsc::UnboundedSender<Change>,
    changes_rx: Mutex<Option<mpsc::UnboundedReceiver<Change>>>,
}

impl Gossip {
    pub fn new(node_id: NodeId, clock: Arc<dyn Clock>, max_hops: Option<u32>) -> Self {
        let mut store = InfoStore::new(node_id, clock);
        if let Some(max_hops) = max_hops {
            store = store.with_max_hops(max_hops);
        }
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Self {
            node_id,
            store: RwLock::new(store),
            subscribers: Arc::new(RwLock::new(Subscribers::default())),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Start delivering change callbacks. Only the first call spawns a task.
    pub fn spawn_dispatcher(&self) -> Option<JoinHandle<()>> {
        let mut changes = self.changes_rx.lock().take()?;
        let subscribers = self.subscribers.clone();
        Some(tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let callbacks = subscribers.read().matching(&change.key);
                trace!(key = %change.key, callbacks = callbacks.len(), "dispatching change");
                for callback in callbacks {
                    callback(&change.key, &change.value);
                }
            }
        }))
    }

    /// Queue changes for the dispatcher. Callers hold the store write lock so
    /// changes are queued in commit order.
    fn notify(&self, changes: Vec<Change>) {
        for change in changes {
            // Receiver gone means the node is shutting down
            let _ = self.changes_tx.send(change);
        }
    }

    /// Write a value originating at this node. Returns whether it replaced
    /// the stored value.
    pub fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, GossipError> {
        let mut store = self.store.write();
        let outcome = store.put(key, value.into(), ttl)?;
        if outcome.applied {
            self.notify(vec![Change {
                key: outcome.info.key,
                value: outcome.info.value,
            }]);
        }
        Ok(outcome.applied)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.read().get_value(key)
    }

    pub fn get_info(&self, key: &str) -> Option<Info> {
        self.store.read().get(key).cloned()
    }

    /// Live `(key, value)` pairs under a prefix, as of the call
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.store
            .read()
            .scan_prefix(prefix)
            .map(|(key, value)| (key.to_string(), value.to_vec()))
            .collect()
    }

    /// Merge one remote info
    pub fn merge(&self, info: Info) -> MergeOutcome {
        self.merge_batch(vec![info]).1
    }

    /// Merge a decoded batch entry by entry under one write lock
    pub fn merge_all(&self, infos: Vec<Info>) -> MergeStats {
        self.merge_batch(infos).0
    }

    fn merge_batch(&self, infos: Vec<Info>) -> (MergeStats, MergeOutcome) {
        let mut stats = MergeStats::default();
        let mut last = MergeOutcome::Stale;
        let mut changes = Vec::new();
        let mut conflicts = Vec::new();
        {
            let mut store = self.store.write();
            for info in infos {
                let key = info.key.clone();
                let origin = info.node_id;
                let outcome = store.merge(info);
                if outcome.is_applied() {
                    if let Some(stored) = store.get(&key) {
                        changes.push(Change {
                            key,
                            value: stored.value.clone(),
                        });
                    }
                } else if outcome == MergeOutcome::Conflict {
                    conflicts.push((key, origin));
                }
                stats.record(outcome);
                last = outcome;
            }
            self.notify(changes);
        }
        for (key, origin) in conflicts {
            error!(
                key = %key,
                origin = %origin,
                "Refused conflicting cluster identity from peer"
            );
        }
        (stats, last)
    }

    pub fn subscribe<F>(&self, pattern: KeyPattern, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.write();
        subscribers.next_id += 1;
        let id = SubscriptionId(subscribers.next_id);
        subscribers.entries.insert(
            id,
            Subscription {
                pattern,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().entries.remove(&id).is_some()
    }

    pub fn high_water_marks(&self) -> BTreeMap<NodeId, Timestamp> {
        self.store.read().high_water_marks()
    }

    pub fn delta_since(&self, marks: &BTreeMap<NodeId, Timestamp>, max_infos: usize) -> Delta {
        self.store.read().delta_since(marks, max_infos)
    }

    /// Drop expired infos
    pub fn sweep(&self) -> usize {
        self.store.write().sweep()
    }

    /// Number of live node descriptors, this node included
    pub fn peer_count(&self) -> usize {
        self.store.read().infos_with_prefix(KEY_NODE_PREFIX).count()
    }

    /// Decoded live node descriptors
    pub fn known_nodes(&self) -> Vec<KnownNode> {
        let store = self.store.read();
        store
            .infos_with_prefix(KEY_NODE_PREFIX)
            .filter_map(|info| {
                let descriptor = match NodeDescriptor::decode(&info.value) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        debug!(key = %info.key, "Skipping malformed descriptor: {}", e);
                        return None;
                    }
                };
                if node_id_from_key(&info.key) != Some(descriptor.node_id) {
                    debug!(key = %info.key, "Descriptor does not match its key");
                    return None;
                }
                Some(KnownNode {
                    descriptor,
                    hops: info.hops,
                })
            })
            .collect()
    }

    /// Pin a durable identity value recovered from storage
    pub fn pin(&self, key: &str, value: Vec<u8>) {
        self.store.write().pin(key, value);
    }

    pub fn pinned(&self, key: &str) -> Option<Vec<u8>> {
        self.store.read().pinned(key).map(<[u8]>::to_vec)
    }

    /// Re-publish pinned identity values that are missing or past half
    /// their TTL. Returns the keys written.
    pub fn refresh_identity(&self, keys: &[&str], ttl: Duration) -> Result<Vec<String>, GossipError> {
        let half = i64::try_from(ttl.as_nanos() / 2).unwrap_or(i64::MAX);
        let mut changes = Vec::new();
        let written = {
            let mut store = self.store.write();
            let now = store.now();
            for key in keys.iter().copied().filter(|key| is_identity_key(key)) {
                let Some(value) = store.pinned(key).map(<[u8]>::to_vec) else {
                    continue;
                };
                let due = store
                    .get(key)
                    .map_or(true, |info| info.remaining_ttl(now) < half);
                if due {
                    let outcome = store.put(key, value, ttl)?;
                    if outcome.applied {
                        changes.push(Change {
                            key: outcome.info.key,
                            value: outcome.info.value,
                        });
                    }
                }
            }
            let written: Vec<String> = changes.iter().map(|c| c.key.clone()).collect();
            self.notify(changes);
            written
        };
        Ok(written)
    }

    /// Identity conflicts refused so far
    pub fn conflicts(&self) -> u64 {
        self.store.read().conflicts()
    }

    /// Number of live infos
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialization hook for external status pages
    pub fn status(&self) -> InfoStatus {
        let store = self.store.read();
        let infos = store
            .infos()
            .map(|info| {
                (
                    info.key.clone(),
                    InfoEntry {
                        value: hex::encode(&info.value),
                        orig_stamp: info.orig_stamp,
                        node_id: info.node_id,
                        ttl_stamp: info.ttl_stamp,
                        hops: info.hops,
                    },
                )
            })
            .collect();
        InfoStatus {
            node_id: self.node_id,
            infos,
        }
    }

    pub fn status_json(&self) -> Result<String, GossipError> {
        Ok(serde_json::to_string(&self.status())?)
    }
}
