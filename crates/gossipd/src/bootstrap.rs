//! Bootstrap and founder election
//!
//! Used by the connection manager whenever this node knows no other peer.
//! Join addresses come first, then the peers persisted by the previous run.
//! When none answers, a node with a durable identity republishes it, a node
//! started without `--join` founds a new cluster, and any other node keeps
//! waiting.

use crate::client::Backoff;
use crate::exchange::{Exchange, ExchangeError};
use crate::manager::IDENTITY_KEYS;
use crate::storage::Storage;
use cluster_gossip_core::keys::{KEY_CLUSTER_ID, KEY_SENTINEL};
use cluster_gossip_core::NodeId;
use cluster_gossip_net::{AddrError, Connection, FrameCodec, PeerAddr};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Alternates kept from refusals during one bootstrap
const MAX_ALTERNATES: usize = 8;

/// Where to look for an existing cluster member
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resolver {
    Static(SocketAddr),
    /// Host name, looked up on every attempt
    Dns(PeerAddr),
}

impl Resolver {
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        if let Ok(addr) = s.trim().parse::<SocketAddr>() {
            return Ok(Resolver::Static(addr));
        }
        Ok(Resolver::Dns(s.parse()?))
    }

    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        match self {
            Resolver::Static(addr) => Ok(vec![*addr]),
            Resolver::Dns(name) => name.resolve().await,
        }
    }

    /// Resolve, giving up after `deadline`
    pub async fn resolve_within(&self, deadline: Duration) -> io::Result<Vec<SocketAddr>> {
        within(deadline, self.resolve()).await
    }
}

async fn within<T>(
    deadline: Duration,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer within {:?}", deadline),
        )),
    }
}

impl fmt::Display for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Static(addr) => write!(f, "{addr}"),
            Resolver::Dns(name) => write!(f, "{name}"),
        }
    }
}

/// Result of one bootstrap attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Exchanged with a live peer; open a link to it
    Joined { addr: String, peer_id: NodeId },
    /// Nobody answered; the durable identity was republished
    Recovered,
    /// Nobody answered; a new cluster identity was created
    Founded,
    /// Nobody answered and this node may not found, or the retry is not due
    Waiting,
}

#[derive(Clone, Debug)]
pub struct BootstrapSettings {
    pub join: Vec<String>,
    pub may_found: bool,
    pub rpc_timeout: Duration,
    pub identity_ttl: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

pub struct Bootstrapper {
    exchange: Arc<Exchange>,
    storage: Arc<Storage>,
    join: Vec<Resolver>,
    may_found: bool,
    /// Addresses that reach this node
    self_addrs: HashSet<SocketAddr>,
    rpc_timeout: Duration,
    identity_ttl: Duration,
    backoff: Backoff,
    next_attempt: Option<Instant>,
    alternates: Vec<String>,
}

impl Bootstrapper {
    pub fn new(
        exchange: Arc<Exchange>,
        storage: Arc<Storage>,
        settings: BootstrapSettings,
        self_addrs: Vec<SocketAddr>,
    ) -> Result<Self, AddrError> {
        let join = settings
            .join
            .iter()
            .map(|entry| Resolver::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exchange,
            storage,
            join,
            may_found: settings.may_found,
            self_addrs: self_addrs.into_iter().collect(),
            rpc_timeout: settings.rpc_timeout,
            identity_ttl: settings.identity_ttl,
            backoff: Backoff::new(settings.backoff_base, settings.backoff_max),
            next_attempt: None,
            alternates: Vec::new(),
        })
    }

    fn is_self(&self, addr: &SocketAddr) -> bool {
        self.self_addrs.iter().any(|own| {
            own == addr
                || (own.ip().is_unspecified() && own.port() == addr.port() && addr.ip().is_loopback())
        })
    }

    /// Join entries, then refusal alternates, then persisted peers; no
    /// duplicates
    fn resolvers(&mut self) -> Vec<(Resolver, bool)> {
        let mut seen = HashSet::new();
        let mut resolvers = Vec::new();
        for resolver in &self.join {
            if seen.insert(resolver.clone()) {
                resolvers.push((resolver.clone(), false));
            }
        }

        let persisted = match self.storage.bootstrap_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Failed to read persisted peers: {}", e);
                Vec::new()
            }
        };
        let alternates = std::mem::take(&mut self.alternates);
        let extra = alternates
            .iter()
            .map(|addr| (addr, false))
            .chain(persisted.iter().map(|addr| (addr, true)));
        for (addr, from_storage) in extra {
            match Resolver::parse(addr) {
                Ok(resolver) if seen.insert(resolver.clone()) => {
                    resolvers.push((resolver, from_storage))
                }
                Ok(_) => {}
                Err(e) => debug!(addr = %addr, "Ignoring bad bootstrap address: {}", e),
            }
        }
        resolvers
    }

    /// Try every resolver once, then fall back to recovery or founding.
    /// Returns `Waiting` without doing anything while backing off.
    pub async fn run_once(&mut self) -> BootstrapOutcome {
        if self.next_attempt.is_some_and(|at| Instant::now() < at) {
            return BootstrapOutcome::Waiting;
        }

        for (resolver, from_storage) in self.resolvers() {
            let addrs = match resolver.resolve_within(self.rpc_timeout).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!(resolver = %resolver, "Resolution failed: {}", e);
                    continue;
                }
            };
            for addr in addrs {
                if self.is_self(&addr) {
                    debug!(resolver = %resolver, "Skipping our own address");
                    if from_storage {
                        self.forget(&resolver);
                    }
                    continue;
                }
                match self.try_peer(addr).await {
                    Ok(peer_id) => {
                        self.backoff.reset();
                        self.next_attempt = None;
                        return BootstrapOutcome::Joined {
                            addr: addr.to_string(),
                            peer_id,
                        };
                    }
                    Err(ExchangeError::Refused { alternate }) => {
                        debug!(addr = %addr, alternate = ?alternate, "Bootstrap peer refused");
                        if let Some(alternate) = alternate {
                            if self.alternates.len() < MAX_ALTERNATES {
                                self.alternates.push(alternate);
                            }
                        }
                    }
                    Err(ExchangeError::SelfConnection) => {
                        self.self_addrs.insert(addr);
                        if from_storage {
                            self.forget(&resolver);
                        }
                    }
                    Err(e) => debug!(addr = %addr, "Bootstrap attempt failed: {}", e),
                }
            }
        }

        let outcome = self.fall_back();
        let delay = self.backoff.next_delay();
        self.next_attempt = Some(Instant::now() + delay);
        outcome
    }

    async fn try_peer(&self, addr: SocketAddr) -> Result<NodeId, ExchangeError> {
        let peer = PeerAddr::from(addr);
        let mut conn = Connection::connect(&peer, self.rpc_timeout, FrameCodec::new()).await?;
        let outcome = self
            .exchange
            .run_round(&mut conn, &BTreeMap::new(), self.rpc_timeout)
            .await?;
        info!(
            addr = %addr,
            peer = %outcome.peer_id,
            applied = outcome.merged.applied,
            "Joined cluster through peer"
        );
        Ok(outcome.peer_id)
    }

    fn forget(&self, resolver: &Resolver) {
        if let Err(e) = self.storage.forget_peer(&resolver.to_string()) {
            debug!(resolver = %resolver, "Failed to forget peer: {}", e);
        }
    }

    fn fall_back(&mut self) -> BootstrapOutcome {
        let gossip = self.exchange.gossip();
        if gossip.pinned(KEY_CLUSTER_ID).is_some() {
            if let Err(e) = gossip.refresh_identity(&IDENTITY_KEYS, self.identity_ttl) {
                warn!("Failed to republish cluster identity: {}", e);
            }
            debug!("No peer reachable, keeping durable cluster identity");
            return BootstrapOutcome::Recovered;
        }

        if !self.may_found {
            warn!(
                resolvers = self.join.len(),
                "Bootstrap exhausted, no peer reachable; will retry"
            );
            return BootstrapOutcome::Waiting;
        }

        match self.found() {
            Ok(cluster_id) => {
                info!(cluster_id = %cluster_id, "Founded new cluster");
                BootstrapOutcome::Founded
            }
            Err(e) => {
                warn!("Failed to found cluster: {}", e);
                BootstrapOutcome::Waiting
            }
        }
    }

    /// Create, pin, persist and publish a fresh cluster identity
    fn found(&self) -> anyhow::Result<String> {
        let gossip = self.exchange.gossip();
        let cluster_id = hex::encode(rand::random::<[u8; 16]>());
        let sentinel = hex::encode(rand::random::<[u8; 16]>());

        for (key, value) in [(KEY_CLUSTER_ID, &cluster_id), (KEY_SENTINEL, &sentinel)] {
            self.storage.put_identity(key, value.as_bytes())?;
            // A value persisted earlier by a racing subscription wins
            let durable = self
                .storage
                .identity(key)?
                .unwrap_or_else(|| value.as_bytes().to_vec());
            gossip.pin(key, durable);
        }
        gossip.refresh_identity(&IDENTITY_KEYS, self.identity_ttl)?;
        Ok(gossip
            .pinned(KEY_CLUSTER_ID)
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or(cluster_id))
    }
}
