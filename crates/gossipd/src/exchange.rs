//! Exchange rounds
//!
//! A round is bidirectional: the initiator pushes the infos it believes the
//! responder lacks together with its high-water marks, and the responder
//! answers with everything newer than those marks plus its own marks. One
//! round in either direction brings two stores to the same state.

use crate::gossip::{Gossip, MergeStats};
use cluster_gossip_core::{NodeId, Timestamp};
use cluster_gossip_net::{Connection, GossipRequest, GossipResponse, TransportError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Exchange errors
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Malformed response: {0}")]
    Decode(TransportError),
    #[error("Peer refused the link (alternate: {alternate:?})")]
    Refused { alternate: Option<String> },
    #[error("Dialed our own node")]
    SelfConnection,
}

impl From<TransportError> for ExchangeError {
    fn from(e: TransportError) -> Self {
        if e.is_malformed() {
            ExchangeError::Decode(e)
        } else {
            ExchangeError::Transport(e)
        }
    }
}

impl ExchangeError {
    /// The peer answered with bytes that did not decode
    pub fn is_malformed(&self) -> bool {
        matches!(self, ExchangeError::Decode(_))
    }
}

/// What one completed round learned about the peer
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub peer_id: NodeId,
    pub peer_addr: String,
    /// Responder's marks; the base for our next request delta
    pub peer_marks: BTreeMap<NodeId, Timestamp>,
    pub merged: MergeStats,
    /// The responder held back infos; another round is needed
    pub truncated: bool,
}

/// Builds and applies exchange messages for one node
pub struct Exchange {
    gossip: Arc<Gossip>,
    /// Our advertised gossip address
    addr: String,
    max_delta_infos: usize,
}

impl Exchange {
    pub fn new(gossip: Arc<Gossip>, addr: impl Into<String>, max_delta_infos: usize) -> Self {
        Self {
            gossip,
            addr: addr.into(),
            max_delta_infos,
        }
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn node_id(&self) -> NodeId {
        self.gossip.node_id()
    }

    /// Request carrying our marks and a delta against what the peer last
    /// reported. Empty `peer_marks` means everything we hold.
    pub fn build_request(&self, peer_marks: &BTreeMap<NodeId, Timestamp>) -> GossipRequest {
        let delta = self.gossip.delta_since(peer_marks, self.max_delta_infos);
        GossipRequest {
            node_id: self.node_id(),
            addr: self.addr.clone(),
            high_water_marks: self.gossip.high_water_marks(),
            delta: delta.infos,
        }
    }

    /// Responder side: merge the pushed delta, answer with ours
    pub fn handle_request(&self, request: GossipRequest) -> GossipResponse {
        let pushed = request.delta.len();
        let merged = self.gossip.merge_all(request.delta);
        let delta = self
            .gossip
            .delta_since(&request.high_water_marks, self.max_delta_infos);
        debug!(
            peer = %request.node_id,
            pushed,
            applied = merged.applied,
            returned = delta.infos.len(),
            truncated = delta.truncated,
            "Served exchange"
        );
        GossipResponse {
            node_id: self.node_id(),
            addr: self.addr.clone(),
            high_water_marks: self.gossip.high_water_marks(),
            delta: delta.infos,
            truncated: delta.truncated,
            refused: false,
            alternate: None,
        }
    }

    /// Initiator side: merge the returned delta
    pub fn apply_response(&self, response: GossipResponse) -> Result<RoundOutcome, ExchangeError> {
        if response.refused {
            return Err(ExchangeError::Refused {
                alternate: response.alternate,
            });
        }
        if response.node_id == self.node_id() {
            return Err(ExchangeError::SelfConnection);
        }
        let merged = self.gossip.merge_all(response.delta);
        Ok(RoundOutcome {
            peer_id: response.node_id,
            peer_addr: response.addr,
            peer_marks: response.high_water_marks,
            merged,
            truncated: response.truncated,
        })
    }

    /// Run one full round over an open connection
    pub async fn run_round(
        &self,
        conn: &mut Connection,
        peer_marks: &BTreeMap<NodeId, Timestamp>,
        deadline: Duration,
    ) -> Result<RoundOutcome, ExchangeError> {
        let request = self.build_request(peer_marks);
        let sent = request.delta.len();
        // A response that fails to decode aborts here, before any merge
        let response = conn.exchange(&request, deadline).await?;
        let outcome = self.apply_response(response)?;
        debug!(
            peer = %outcome.peer_id,
            addr = %conn.peer_addr(),
            sent,
            applied = outcome.merged.applied,
            truncated = outcome.truncated,
            "Exchange round complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_gossip_core::{Info, ManualClock};
    use cluster_gossip_net::{FrameCodec, PeerAddr};
    use tokio::net::TcpListener;

    const SEC: i64 = 1_000_000_000;

    fn node(id: u32, clock: &Arc<ManualClock>) -> Exchange {
        let gossip = Arc::new(Gossip::new(NodeId(id), clock.clone(), None));
        Exchange::new(gossip, format!("127.0.0.1:{}", 9000 + id), 100)
    }

    fn info(key: &str, value: &str, origin: u32, stamp: i64) -> Info {
        Info {
            key: key.into(),
            value: value.as_bytes().to_vec(),
            node_id: NodeId(origin),
            orig_stamp: stamp,
            ttl_stamp: stamp + 3600 * SEC,
            hops: 0,
        }
    }

    fn contents(exchange: &Exchange) -> Vec<(String, Vec<u8>, i64)> {
        exchange
            .gossip()
            .status()
            .infos
            .into_iter()
            .map(|(key, entry)| (key, hex::decode(entry.value).unwrap(), entry.orig_stamp))
            .collect()
    }

    /// A = {k1:(v1,t=5)}, B = {k1:(v1,t=3), k2:(v2,t=1)}
    fn scenario() -> (Exchange, Exchange) {
        let clock = Arc::new(ManualClock::new(10 * SEC));
        let a = node(1, &clock);
        let b = node(2, &clock);
        a.gossip().merge(info("k1", "v1", 1, 5 * SEC));
        b.gossip().merge(info("k1", "v1", 2, 3 * SEC));
        b.gossip().merge(info("k2", "v2", 2, SEC));
        (a, b)
    }

    fn round(initiator: &Exchange, responder: &Exchange) -> RoundOutcome {
        let request = initiator.build_request(&BTreeMap::new());
        let response = responder.handle_request(request);
        initiator.apply_response(response).unwrap()
    }

    fn expected() -> Vec<(String, Vec<u8>, i64)> {
        vec![
            ("k1".into(), b"v1".to_vec(), 5 * SEC),
            ("k2".into(), b"v2".to_vec(), SEC),
        ]
    }

    #[test]
    fn test_single_round_converges_a_to_b() {
        let (a, b) = scenario();
        let outcome = round(&a, &b);
        assert_eq!(outcome.peer_id, NodeId(2));
        assert_eq!(contents(&a), expected());
        assert_eq!(contents(&b), expected());
    }

    #[test]
    fn test_single_round_converges_b_to_a() {
        let (a, b) = scenario();
        round(&b, &a);
        assert_eq!(contents(&a), expected());
        assert_eq!(contents(&b), expected());
    }

    #[test]
    fn test_second_round_sends_nothing() {
        let (a, b) = scenario();
        let first = round(&a, &b);

        let request = a.build_request(&first.peer_marks);
        assert!(request.delta.is_empty());
        let response = b.handle_request(request);
        assert!(response.delta.is_empty());
        assert!(!response.truncated);
    }

    #[test]
    fn test_hops_increment_per_propagation() {
        let clock = Arc::new(ManualClock::new(10 * SEC));
        let a = node(1, &clock);
        let b = node(2, &clock);
        let c = node(3, &clock);
        a.gossip()
            .put("k", b"v".to_vec(), Duration::from_secs(60))
            .unwrap();

        round(&b, &a);
        assert_eq!(b.gossip().get_info("k").unwrap().hops, 1);
        round(&c, &b);
        assert_eq!(c.gossip().get_info("k").unwrap().hops, 2);
    }

    #[test]
    fn test_refusal_and_self_connection() {
        let clock = Arc::new(ManualClock::new(SEC));
        let a = node(1, &clock);

        let refusal = GossipResponse::redirect(NodeId(2), "b".into(), Some("c:1".into()));
        assert!(matches!(
            a.apply_response(refusal),
            Err(ExchangeError::Refused { alternate: Some(_) })
        ));

        // Refused with nowhere else to go is still a refusal, and merges nothing
        let mut bare = GossipResponse::redirect(NodeId(2), "b".into(), None);
        bare.delta.push(info("k", "v", 2, SEC));
        assert!(matches!(
            a.apply_response(bare),
            Err(ExchangeError::Refused { alternate: None })
        ));
        assert!(a.gossip().get_info("k").is_none());

        let echo = GossipResponse {
            node_id: NodeId(1),
            ..Default::default()
        };
        assert!(matches!(
            a.apply_response(echo),
            Err(ExchangeError::SelfConnection)
        ));
    }

    #[test]
    fn test_truncated_response_completes_over_rounds() {
        let clock = Arc::new(ManualClock::new(100 * SEC));
        let a = node(1, &clock);
        let b = Exchange::new(Arc::new(Gossip::new(NodeId(2), clock.clone(), None)), "b", 2);
        for i in 0..5 {
            b.gossip().merge(info(&format!("k{i}"), "v", 2, (i + 1) * SEC));
        }

        let mut rounds = 0;
        loop {
            rounds += 1;
            let response = b.handle_request(a.build_request(&BTreeMap::new()));
            let outcome = a.apply_response(response).unwrap();
            if !outcome.truncated {
                break;
            }
            assert!(rounds < 10);
        }
        assert_eq!(rounds, 3);
        assert_eq!(a.gossip().len(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_response_leaves_store_unchanged() {
        let clock = Arc::new(ManualClock::new(10 * SEC));
        let a = node(1, &clock);
        a.gossip().merge(info("k", "v", 3, SEC));
        let before = contents(&a);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let deadline = Duration::from_secs(2);
        let peer = tokio::spawn(async move {
            let (stream, from) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, from, FrameCodec::new());
            conn.recv(deadline).await.unwrap().unwrap();

            // Delta intact, trailing fields cut off
            let response = GossipResponse {
                node_id: NodeId(2),
                addr: "b".into(),
                delta: vec![info("k", "newer", 2, 5 * SEC), info("k2", "v", 2, 5 * SEC)],
                ..Default::default()
            };
            let mut frame = response.to_frame().unwrap();
            let cut = frame.payload.len() - 3;
            frame.payload.truncate(cut);
            conn.send(frame, deadline).await.unwrap();
        });

        let mut conn = Connection::connect(&PeerAddr::from(addr), deadline, FrameCodec::new())
            .await
            .unwrap();
        let err = a
            .run_round(&mut conn, &BTreeMap::new(), deadline)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(contents(&a), before);
        assert_eq!(a.gossip().len(), 1);
        peer.await.unwrap();
    }
}
