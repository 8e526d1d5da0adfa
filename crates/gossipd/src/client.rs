//! Outgoing peer links
//!
//! Each link is its own task running
//! `Idle -> Connecting -> Exchanging -> (Closed | Reconnecting)`.
//! Exchanging repeats every gossip interval over one connection. Any error
//! moves the link to Reconnecting with exponential backoff; a link only
//! closes itself after too many consecutive failures, when refused, or when
//! the peer turns out to be ourselves or already linked.

use crate::exchange::{Exchange, ExchangeError};
use crate::manager::LinkTable;
use cluster_gossip_core::NodeId;
use cluster_gossip_net::{Connection, FrameCodec, PeerAddr};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Link lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Exchanging,
    Reconnecting,
    Closed,
}

/// Published state of one outgoing link
#[derive(Clone, Debug)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Learned from the first completed round
    pub peer_id: Option<NodeId>,
    /// Consecutive failures
    pub failures: u32,
    pub rounds: u64,
    /// Address offered by a peer that refused us
    pub alternate: Option<String>,
    pub last_error: Option<String>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            peer_id: None,
            failures: 0,
            rounds: 0,
            alternate: None,
            last_error: None,
        }
    }
}

/// Timing and retry policy shared by all links
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub gossip_interval: Duration,
    pub rpc_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_failures: u32,
}

/// Exponential backoff with jitter
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next delay: `base * 2^attempt` capped at `max`, then jittered into
    /// the upper half so retries from many nodes spread out
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let ceiling = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let jitter_nanos = rand::thread_rng().gen_range(0..=half.as_nanos() as u64);
        half + Duration::from_nanos(jitter_nanos)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Why a session ended without an error
enum SessionEnd {
    /// Another link already reaches this peer
    Duplicate(NodeId),
}

/// One outgoing link
pub struct Link {
    addr: PeerAddr,
    exchange: Arc<Exchange>,
    table: Arc<LinkTable>,
    settings: LinkSettings,
}

impl Link {
    pub fn new(
        addr: PeerAddr,
        exchange: Arc<Exchange>,
        table: Arc<LinkTable>,
        settings: LinkSettings,
    ) -> Self {
        Self {
            addr,
            exchange,
            table,
            settings,
        }
    }

    /// Register the link and start its task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.table.insert(self.addr.as_str());
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let key = self.addr.as_str().to_string();
        let mut backoff = Backoff::new(self.settings.backoff_base, self.settings.backoff_max);
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let result = tokio::select! {
                result = self.session(&mut failures, &mut backoff) => result,
                _ = shutdown.changed() => break,
            };

            let err = match result {
                Ok(SessionEnd::Duplicate(peer)) => {
                    debug!(addr = %self.addr, peer = %peer, "Peer already linked, closing");
                    self.table.update(&key, |s| s.state = LinkState::Closed);
                    return;
                }
                Err(err) => err,
            };

            failures += 1;
            match err {
                ExchangeError::Refused { alternate } => {
                    info!(addr = %self.addr, alternate = ?alternate, "Peer refused link");
                    self.table.update(&key, |s| {
                        s.state = LinkState::Closed;
                        s.alternate = alternate;
                    });
                    return;
                }
                ExchangeError::SelfConnection => {
                    debug!(addr = %self.addr, "Dialed ourselves, closing");
                    self.table.update(&key, |s| s.state = LinkState::Closed);
                    return;
                }
                err => {
                    if failures >= self.settings.max_failures {
                        warn!(
                            addr = %self.addr,
                            failures,
                            "Giving up on link: {}", err
                        );
                        self.table.update(&key, |s| {
                            s.state = LinkState::Closed;
                            s.failures = failures;
                            s.last_error = Some(err.to_string());
                        });
                        return;
                    }

                    let delay = backoff.next_delay();
                    if err.is_malformed() {
                        warn!(addr = %self.addr, "Discarding round, malformed payload: {}", err);
                    } else {
                        debug!(addr = %self.addr, failures, ?delay, "Exchange failed: {}", err);
                    }
                    self.table.update(&key, |s| {
                        s.state = LinkState::Reconnecting;
                        s.failures = failures;
                        s.last_error = Some(err.to_string());
                    });

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.table.update(&key, |s| s.state = LinkState::Closed);
    }

    /// Connect and exchange until something goes wrong
    async fn session(
        &self,
        failures: &mut u32,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd, ExchangeError> {
        let key = self.addr.as_str();
        self.table.update(key, |s| s.state = LinkState::Connecting);
        let mut conn =
            Connection::connect(&self.addr, self.settings.rpc_timeout, FrameCodec::new()).await?;

        // A fresh connection starts from empty marks: push everything once
        let mut peer_marks = BTreeMap::new();
        let mut claimed = false;
        loop {
            let outcome = self
                .exchange
                .run_round(&mut conn, &peer_marks, self.settings.rpc_timeout)
                .await?;

            if !claimed {
                if !self.table.claim_peer(key, outcome.peer_id) {
                    return Ok(SessionEnd::Duplicate(outcome.peer_id));
                }
                claimed = true;
                info!(addr = %self.addr, peer = %outcome.peer_id, "Link established");
            }

            *failures = 0;
            backoff.reset();
            self.table.update(key, |s| {
                s.state = LinkState::Exchanging;
                s.failures = 0;
                s.rounds += 1;
                s.last_error = None;
            });

            peer_marks = outcome.peer_marks;
            if !outcome.truncated {
                sleep(self.settings.gossip_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::Gossip;
    use cluster_gossip_core::ManualClock;
    use cluster_gossip_net::GossipResponse;
    use tokio::net::TcpListener;

    fn settings() -> LinkSettings {
        LinkSettings {
            gossip_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            max_failures: 3,
        }
    }

    fn exchange(node: u32) -> Arc<Exchange> {
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let gossip = Arc::new(Gossip::new(NodeId(node), clock, None));
        Arc::new(Exchange::new(gossip, format!("node-{node}:1"), 100))
    }

    async fn wait_closed(table: &LinkTable, addr: &str) -> LinkStatus {
        for _ in 0..300 {
            if let Some(status) = table.status(addr) {
                if status.state == LinkState::Closed {
                    return status;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("link to {addr} never closed");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();
        for (attempt, delay) in delays.iter().enumerate() {
            let ceiling = Duration::from_millis((100u64 << attempt).min(1000));
            assert!(*delay >= ceiling / 2 && *delay <= ceiling, "{attempt}: {delay:?}");
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unreachable_peer_closes_after_max_failures() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddr::from(listener.local_addr().unwrap());
        drop(listener);

        let table = Arc::new(LinkTable::default());
        let (_tx, rx) = watch::channel(false);
        let handle = Link::new(addr.clone(), exchange(1), table.clone(), settings()).spawn(rx);

        let status = wait_closed(&table, addr.as_str()).await;
        assert_eq!(status.failures, 3);
        assert!(status.last_error.is_some());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_refusal_records_alternate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddr::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer, FrameCodec::new());
            let _ = conn.recv(Duration::from_secs(5)).await;
            let refusal =
                GossipResponse::redirect(NodeId(2), "b".into(), Some("10.0.0.9:9100".into()));
            conn.send(refusal.to_frame().unwrap(), Duration::from_secs(5))
                .await
                .unwrap();
        });

        let table = Arc::new(LinkTable::default());
        let (_tx, rx) = watch::channel(false);
        Link::new(addr.clone(), exchange(1), table.clone(), settings()).spawn(rx);

        let status = wait_closed(&table, addr.as_str()).await;
        assert_eq!(status.alternate.as_deref(), Some("10.0.0.9:9100"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_reconnecting_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddr::from(listener.local_addr().unwrap());
        drop(listener);

        let mut slow = settings();
        slow.max_failures = u32::MAX;
        slow.backoff_base = Duration::from_secs(30);
        slow.backoff_max = Duration::from_secs(30);

        let table = Arc::new(LinkTable::default());
        let (tx, rx) = watch::channel(false);
        let handle = Link::new(addr.clone(), exchange(1), table.clone(), slow).spawn(rx);

        sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.status(addr.as_str()).unwrap().state, LinkState::Closed);
    }
}
