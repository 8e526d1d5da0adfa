//! Gossip exchange messages
//!
//! One exchange round is a single request/response pair. Both sides carry
//! their high-water marks (max origin stamp seen per origin node) and a delta
//! of infos the other side is missing.

use crate::framing::{Frame, FrameType};
use cluster_gossip_core::{Info, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message decode errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Unexpected frame type: expected {expected:?}, got {got:?}")]
    UnexpectedFrame { expected: FrameType, got: FrameType },
    #[error("Malformed payload: {0}")]
    Malformed(#[from] postcard::Error),
}

/// Exchange request sent by the initiator of a round
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRequest {
    /// Sender's node id
    pub node_id: NodeId,
    /// Sender's advertised gossip address
    pub addr: String,
    /// Max origin stamp the sender holds, per origin node
    pub high_water_marks: BTreeMap<NodeId, Timestamp>,
    /// Infos the sender believes the receiver lacks
    pub delta: Vec<Info>,
}

/// Exchange response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipResponse {
    /// Responder's node id
    pub node_id: NodeId,
    /// Responder's advertised gossip address
    pub addr: String,
    /// Max origin stamp the responder holds, per origin node
    pub high_water_marks: BTreeMap<NodeId, Timestamp>,
    /// Infos newer than the initiator's marks
    pub delta: Vec<Info>,
    /// More infos qualified than fit in one response
    pub truncated: bool,
    /// The responder refused the link and merged nothing
    pub refused: bool,
    /// Address to try instead, when the responder knows one
    pub alternate: Option<String>,
}

fn decode_frame<T: for<'de> Deserialize<'de>>(
    frame: &Frame,
    expected: FrameType,
) -> Result<T, MessageError> {
    if frame.frame_type != expected {
        return Err(MessageError::UnexpectedFrame {
            expected,
            got: frame.frame_type,
        });
    }
    Ok(postcard::from_bytes(&frame.payload)?)
}

impl GossipRequest {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::GossipRequest, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        decode_frame(frame, FrameType::GossipRequest)
    }
}

impl GossipResponse {
    pub fn to_frame(&self) -> Result<Frame, postcard::Error> {
        let payload = postcard::to_allocvec(self)?;
        Ok(Frame::new(FrameType::GossipResponse, payload))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        decode_frame(frame, FrameType::GossipResponse)
    }

    /// Refusal, with an alternate peer address if one is known
    pub fn redirect(node_id: NodeId, addr: String, alternate: Option<String>) -> Self {
        Self {
            node_id,
            addr,
            refused: true,
            alternate,
            ..Default::default()
        }
    }
}
