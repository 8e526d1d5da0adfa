//! Connection manager
//!
//! One scheduler task that keeps the outgoing fanout topped up, reaps dead
//! links, falls back to bootstrap when no peer is known, and keeps this
//! node's own infos fresh.

use crate::bootstrap::{BootstrapOutcome, Bootstrapper};
use crate::client::{Link, LinkSettings, LinkState, LinkStatus};
use crate::exchange::Exchange;
use crate::gossip::{Gossip, GossipError, KnownNode};
use crate::storage::Storage;
use cluster_gossip_core::keys::{node_key, KEY_CLUSTER_ID, KEY_SENTINEL};
use cluster_gossip_core::{NodeDescriptor, NodeId};
use cluster_gossip_net::PeerAddr;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Identity keys this node keeps published
pub const IDENTITY_KEYS: [&str; 2] = [KEY_CLUSTER_ID, KEY_SENTINEL];

/// Alternates remembered from refusals
const MAX_ALTERNATES: usize = 16;

/// Shared view of this node's links, outgoing and incoming
#[derive(Default)]
pub struct LinkTable {
    outgoing: RwLock<HashMap<String, LinkStatus>>,
    /// Incoming connections and the node id each reported, once known
    incoming: RwLock<HashMap<SocketAddr, Option<NodeId>>>,
}

impl LinkTable {
    pub fn insert(&self, addr: &str) {
        self.outgoing
            .write()
            .insert(addr.to_string(), LinkStatus::default());
    }

    pub fn update(&self, addr: &str, f: impl FnOnce(&mut LinkStatus)) {
        if let Some(status) = self.outgoing.write().get_mut(addr) {
            f(status);
        }
    }

    /// Record the peer behind `addr`. Fails if another live link already
    /// reaches that peer.
    pub fn claim_peer(&self, addr: &str, peer_id: NodeId) -> bool {
        let mut outgoing = self.outgoing.write();
        let taken = outgoing.iter().any(|(other, status)| {
            other != addr && status.peer_id == Some(peer_id) && status.state != LinkState::Closed
        });
        if taken {
            return false;
        }
        if let Some(status) = outgoing.get_mut(addr) {
            status.peer_id = Some(peer_id);
        }
        true
    }

    pub fn status(&self, addr: &str) -> Option<LinkStatus> {
        self.outgoing.read().get(addr).cloned()
    }

    pub fn remove(&self, addr: &str) -> Option<LinkStatus> {
        self.outgoing.write().remove(addr)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.outgoing.read().contains_key(addr)
    }

    /// Outgoing links not yet closed
    pub fn active_count(&self) -> usize {
        self.outgoing
            .read()
            .values()
            .filter(|status| status.state != LinkState::Closed)
            .count()
    }

    pub fn snapshot(&self) -> Vec<(String, LinkStatus)> {
        let mut links: Vec<_> = self
            .outgoing
            .read()
            .iter()
            .map(|(addr, status)| (addr.clone(), status.clone()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }

    pub fn register_incoming(&self, addr: SocketAddr) {
        self.incoming.write().insert(addr, None);
    }

    pub fn identify_incoming(&self, addr: SocketAddr, peer_id: NodeId) {
        if let Some(slot) = self.incoming.write().get_mut(&addr) {
            *slot = Some(peer_id);
        }
    }

    pub fn drop_incoming(&self, addr: SocketAddr) {
        self.incoming.write().remove(&addr);
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.read().len()
    }

    /// Peers we already exchange with directly, in either direction
    pub fn linked_peers(&self) -> HashSet<NodeId> {
        let outgoing = self.outgoing.read();
        let incoming = self.incoming.read();
        outgoing
            .values()
            .filter(|status| status.state != LinkState::Closed)
            .filter_map(|status| status.peer_id)
            .chain(incoming.values().flatten().copied())
            .collect()
    }
}

/// Scheduler policy
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub max_fanout: usize,
    pub tick_interval: Duration,
    pub node_ttl: Duration,
    pub identity_ttl: Duration,
    pub max_persisted_peers: usize,
    pub link: LinkSettings,
}

/// Owns the outgoing link tasks of one node
pub struct ConnectionManager {
    exchange: Arc<Exchange>,
    storage: Arc<Storage>,
    bootstrapper: Bootstrapper,
    links: Arc<LinkTable>,
    settings: ManagerSettings,
    descriptor: NodeDescriptor,
    handles: HashMap<String, JoinHandle<()>>,
    alternates: VecDeque<String>,
    last_publish: Option<Instant>,
    persisted: HashSet<String>,
}

impl ConnectionManager {
    pub fn new(
        exchange: Arc<Exchange>,
        storage: Arc<Storage>,
        bootstrapper: Bootstrapper,
        links: Arc<LinkTable>,
        settings: ManagerSettings,
        descriptor: NodeDescriptor,
    ) -> Self {
        Self {
            exchange,
            storage,
            bootstrapper,
            links,
            settings,
            descriptor,
            handles: HashMap::new(),
            alternates: VecDeque::new(),
            last_publish: None,
            persisted: HashSet::new(),
        }
    }

    fn gossip(&self) -> &Arc<Gossip> {
        self.exchange.gossip()
    }

    /// Run until shutdown, then wait for every link to stop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node = %self.descriptor.node_id,
            fanout = self.settings.max_fanout,
            "Connection manager started"
        );
        let mut ticker = interval(self.settings.tick_interval);
        // Links get their own receiver; ours is polled below
        let link_shutdown = shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    // The whole tick is dropped if shutdown arrives mid-bootstrap
                    tokio::select! {
                        _ = self.tick(&link_shutdown) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        for (addr, handle) in self.handles.drain() {
            if handle.await.is_err() {
                debug!(addr = %addr, "Link task panicked");
            }
        }
        info!("Connection manager stopped");
    }

    async fn tick(&mut self, shutdown: &watch::Receiver<bool>) {
        self.reap();
        self.maintain();

        if self.needs_bootstrap() {
            if let BootstrapOutcome::Joined { addr, peer_id } = self.bootstrapper.run_once().await {
                info!(addr = %addr, peer = %peer_id, "Bootstrapped");
                self.open_link(&addr, shutdown);
            }
        } else {
            self.top_up(shutdown);
        }

        self.persist_peers();
    }

    /// Drop finished link tasks, keeping any alternate they were offered
    fn reap(&mut self) {
        let finished: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in finished {
            self.handles.remove(&addr);
            if let Some(status) = self.links.remove(&addr) {
                debug!(addr = %addr, rounds = status.rounds, "Reaped link");
                if let Some(alternate) = status.alternate {
                    if self.alternates.len() < MAX_ALTERNATES {
                        self.alternates.push_back(alternate);
                    }
                }
            }
        }
    }

    /// Sweep expired infos and re-publish our own ones when due
    fn maintain(&mut self) {
        let swept = self.gossip().sweep();
        if swept > 0 {
            debug!(swept, "Swept expired infos");
        }

        let due = self
            .last_publish
            .map_or(true, |at| at.elapsed() >= self.settings.node_ttl / 2);
        if due {
            self.publish_descriptor();
        }

        match self
            .gossip()
            .refresh_identity(&IDENTITY_KEYS, self.settings.identity_ttl)
        {
            Ok(keys) if !keys.is_empty() => debug!(?keys, "Refreshed identity"),
            Ok(_) => {}
            Err(e) => warn!("Failed to refresh identity: {}", e),
        }
    }

    fn publish_descriptor(&mut self) {
        let key = node_key(self.descriptor.node_id);
        let result = self
            .descriptor
            .encode()
            .map_err(GossipError::from)
            .and_then(|value| self.gossip().put(&key, value, self.settings.node_ttl));
        match result {
            Ok(_) => self.last_publish = Some(Instant::now()),
            Err(e) => warn!("Failed to publish node descriptor: {}", e),
        }
    }

    /// No peer is known besides ourselves and no link is open
    fn needs_bootstrap(&self) -> bool {
        let own = self.descriptor.node_id;
        self.links.active_count() == 0
            && self.links.incoming_count() == 0
            && self.alternates.is_empty()
            && self
                .gossip()
                .known_nodes()
                .iter()
                .all(|node| node.descriptor.node_id == own)
    }

    fn top_up(&mut self, shutdown: &watch::Receiver<bool>) {
        let mut open = self.settings.max_fanout.saturating_sub(self.links.active_count());
        while open > 0 {
            let Some(alternate) = self.alternates.pop_front() else {
                break;
            };
            if !self.links.contains(&alternate) && alternate != self.exchange.addr() {
                self.open_link(&alternate, shutdown);
                open -= 1;
            }
        }
        if open == 0 {
            return;
        }

        let candidates = select_peers(
            self.gossip().known_nodes(),
            self.descriptor.node_id,
            &self.links.linked_peers(),
            |addr| self.links.contains(addr),
            open,
        );
        for candidate in candidates {
            self.open_link(&candidate.descriptor.address, shutdown);
        }
    }

    fn open_link(&mut self, addr: &str, shutdown: &watch::Receiver<bool>) {
        let peer_addr: PeerAddr = match addr.parse() {
            Ok(peer_addr) => peer_addr,
            Err(e) => {
                debug!(addr = %addr, "Skipping unusable peer address: {}", e);
                return;
            }
        };
        if self.links.contains(peer_addr.as_str()) {
            return;
        }
        debug!(addr = %peer_addr, "Opening link");
        let key = peer_addr.as_str().to_string();
        let link = Link::new(
            peer_addr,
            self.exchange.clone(),
            self.links.clone(),
            self.settings.link.clone(),
        );
        self.handles.insert(key, link.spawn(shutdown.clone()));
    }

    /// Remember addresses of known peers for the next restart, keeping the
    /// most recently seen ones
    fn persist_peers(&mut self) {
        let seen_at = self
            .gossip()
            .get_info(&node_key(self.descriptor.node_id))
            .map_or(0, |info| info.orig_stamp);
        let mut recorded = 0;
        for node in self.gossip().known_nodes() {
            let address = node.descriptor.address;
            if node.descriptor.node_id == self.descriptor.node_id
                || self.persisted.contains(&address)
            {
                continue;
            }
            match self.storage.record_peer(&address, seen_at) {
                Ok(()) => {
                    self.persisted.insert(address);
                    recorded += 1;
                }
                Err(e) => warn!(addr = %address, "Failed to persist peer address: {}", e),
            }
        }
        if recorded == 0 {
            return;
        }
        match self.storage.prune_peers(self.settings.max_persisted_peers) {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "Pruned persisted peer addresses"),
            Err(e) => warn!("Failed to prune persisted peers: {}", e),
        }
    }
}

/// Choose up to `count` peers to dial: not ourselves, not already linked by
/// node id or address. Peers whose descriptor travelled the most hops come
/// first, ties broken at random.
pub fn select_peers(
    known: Vec<KnownNode>,
    own: NodeId,
    linked: &HashSet<NodeId>,
    is_linked_addr: impl Fn(&str) -> bool,
    count: usize,
) -> Vec<KnownNode> {
    let mut candidates: Vec<KnownNode> = known
        .into_iter()
        .filter(|node| node.descriptor.node_id != own)
        .filter(|node| !linked.contains(&node.descriptor.node_id))
        .filter(|node| !is_linked_addr(&node.descriptor.address))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    // Stable sort keeps the shuffled order among equal hop counts
    candidates.sort_by_key(|node| Reverse(node.hops));
    candidates.truncate(count);
    candidates
}
