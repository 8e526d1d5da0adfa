//! Versioned key/value store with freshness merging
//!
//! The store keeps at most one [`Info`] per key: whichever has the greatest
//! `(orig_stamp, node_id)`. Merging is commutative, associative and
//! idempotent, so infos may arrive from any peer in any order.
//!
//! The store does no locking and no I/O. Callers wrap it in a lock and keep
//! critical sections short.

use crate::clock::{duration_nanos, Clock};
use crate::error::{Error, Result};
use crate::keys::is_identity_key;
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

/// Result of merging a remote info
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The info replaced (or created) the stored value
    Applied,
    /// An equal-or-fresher value is already stored
    Stale,
    /// The info was already past its deadline
    Expired,
    /// The info travelled more hops than allowed
    HopLimit,
    /// Identity key with a value different from the pinned one
    Conflict,
    /// The info has no key
    Invalid,
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied)
    }
}

/// Result of a local write
#[derive(Clone, Debug)]
pub struct PutOutcome {
    /// Whether the write replaced the stored value
    pub applied: bool,
    /// The info built for the write
    pub info: Info,
}

/// Infos selected for a peer
#[derive(Clone, Debug, Default)]
pub struct Delta {
    pub infos: Vec<Info>,
    /// Some qualifying infos were held back by the size bound
    pub truncated: bool,
}

/// Per-node table of current infos
pub struct InfoStore {
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    infos: BTreeMap<String, Info>,
    /// Identity values that must never change once observed
    pinned: HashMap<String, Vec<u8>>,
    max_hops: Option<u32>,
    /// Last stamp handed to a local write
    last_stamp: Timestamp,
    conflicts: u64,
}

impl InfoStore {
    /// Create an empty store for the given node
    pub fn new(node_id: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            node_id,
            clock,
            infos: BTreeMap::new(),
            pinned: HashMap::new(),
            max_hops: None,
            last_stamp: 0,
            conflicts: 0,
        }
    }

    /// Drop incoming infos that travelled more than `max_hops`
    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = Some(max_hops);
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Write a value originating at this node
    pub fn put(&mut self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<PutOutcome> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if ttl.is_zero() {
            return Err(Error::InvalidTtl { key: key.into() });
        }
        if let Some(pinned) = self.pinned.get(key) {
            if *pinned != value {
                return Err(Error::IdentityConflict {
                    key: key.into(),
                    pinned: hex::encode(pinned),
                    offered: hex::encode(&value),
                });
            }
        }

        let stamp = self.next_stamp();
        let info = Info {
            key: key.into(),
            value,
            node_id: self.node_id,
            orig_stamp: stamp,
            ttl_stamp: stamp.saturating_add(duration_nanos(ttl)),
            hops: 0,
        };
        let applied = self.apply(info.clone());
        Ok(PutOutcome { applied, info })
    }

    /// Merge an info received from a peer
    pub fn merge(&mut self, info: Info) -> MergeOutcome {
        if info.key.is_empty() {
            return MergeOutcome::Invalid;
        }
        if info.is_expired(self.clock.now()) {
            return MergeOutcome::Expired;
        }
        if self.max_hops.is_some_and(|max| info.hops > max) {
            return MergeOutcome::HopLimit;
        }
        if let Some(pinned) = self.pinned.get(&info.key) {
            if *pinned != info.value {
                self.conflicts += 1;
                return MergeOutcome::Conflict;
            }
        }

        if self.apply(info) {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Stale
        }
    }

    /// Replace the stored info if the candidate is fresher, or if the stored
    /// one has expired.
    fn apply(&mut self, info: Info) -> bool {
        let now = self.clock.now();
        if let Some(existing) = self.infos.get(&info.key) {
            if !existing.is_expired(now) && !info.is_fresher_than(existing) {
                return false;
            }
        }
        if is_identity_key(&info.key) {
            self.pinned
                .entry(info.key.clone())
                .or_insert_with(|| info.value.clone());
        }
        self.infos.insert(info.key.clone(), info);
        true
    }

    fn next_stamp(&mut self) -> Timestamp {
        let stamp = self.clock.now().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        stamp
    }

    /// Current non-expired info for a key
    pub fn get(&self, key: &str) -> Option<&Info> {
        let now = self.clock.now();
        self.infos.get(key).filter(|info| !info.is_expired(now))
    }

    /// Current non-expired value for a key
    pub fn get_value(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).map(|info| info.value.clone())
    }

    /// Live infos whose key starts with `prefix`, in key order
    pub fn infos_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = &'a Info> + 'a {
        let now = self.clock.now();
        self.infos
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(_, info)| info)
            .filter(move |info| !info.is_expired(now))
    }

    /// Live `(key, value)` pairs under a prefix
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a [u8])> + 'a {
        self.infos_with_prefix(prefix)
            .map(|info| (info.key.as_str(), info.value.as_slice()))
    }

    /// All live infos in key order
    pub fn infos(&self) -> impl Iterator<Item = &Info> + '_ {
        let now = self.clock.now();
        self.infos.values().filter(move |info| !info.is_expired(now))
    }

    /// Number of live infos
    pub fn len(&self) -> usize {
        self.infos().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest origin stamp seen per origin node, over live infos
    pub fn high_water_marks(&self) -> BTreeMap<NodeId, Timestamp> {
        let mut marks = BTreeMap::new();
        for info in self.infos() {
            let mark = marks.entry(info.node_id).or_insert(info.orig_stamp);
            if info.orig_stamp > *mark {
                *mark = info.orig_stamp;
            }
        }
        marks
    }

    /// Live infos newer than the peer's mark for their origin.
    ///
    /// Returned infos have their hop count incremented. When more than
    /// `max_infos` qualify, origins whose infos sit fewest hops away (then
    /// the most recently written) are served first. Within an origin infos
    /// go out oldest first, so the peer's mark for that origin never passes
    /// an info it has not received.
    pub fn delta_since(&self, marks: &BTreeMap<NodeId, Timestamp>, max_infos: usize) -> Delta {
        let candidates: Vec<&Info> = self
            .infos()
            .filter(|info| {
                marks
                    .get(&info.node_id)
                    .map_or(true, |mark| info.orig_stamp > *mark)
            })
            .collect();

        let propagate = |info: &Info| Info {
            hops: info.hops.saturating_add(1),
            ..info.clone()
        };

        if candidates.len() <= max_infos {
            return Delta {
                infos: candidates.into_iter().map(propagate).collect(),
                truncated: false,
            };
        }

        let mut by_origin: BTreeMap<NodeId, Vec<&Info>> = BTreeMap::new();
        for info in candidates {
            by_origin.entry(info.node_id).or_default().push(info);
        }
        let mut origins: Vec<(u32, Timestamp, NodeId)> = by_origin
            .iter_mut()
            .map(|(origin, infos)| {
                infos.sort_by_key(|info| info.orig_stamp);
                let min_hops = infos.iter().map(|i| i.hops).min().unwrap_or(0);
                let newest = infos.last().map_or(0, |i| i.orig_stamp);
                (min_hops, newest, *origin)
            })
            .collect();
        origins.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)).then(a.2.cmp(&b.2)));

        let mut infos = Vec::with_capacity(max_infos);
        for (_, _, origin) in origins {
            let budget = max_infos - infos.len();
            if budget == 0 {
                break;
            }
            if let Some(group) = by_origin.get(&origin) {
                infos.extend(group.iter().take(budget).map(|info| propagate(*info)));
            }
        }

        Delta {
            infos,
            truncated: true,
        }
    }

    /// Physically remove expired infos, returning how many were dropped
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.infos.len();
        self.infos.retain(|_, info| !info.is_expired(now));
        before - self.infos.len()
    }

    /// Pin a durable identity value. Merges offering another value are refused.
    pub fn pin(&mut self, key: &str, value: Vec<u8>) {
        self.pinned.insert(key.into(), value);
    }

    pub fn pinned(&self, key: &str) -> Option<&[u8]> {
        self.pinned.get(key).map(Vec::as_slice)
    }

    /// Number of identity conflicts refused so far
    pub fn conflicts(&self) -> u64 {
        self.conflicts
    }
}
