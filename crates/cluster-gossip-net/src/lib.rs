//! Networking primitives for the cluster gossip network
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Exchange request/response messages
//! - Peer addressing and resolution
//! - Deadline-bounded TCP connections

pub mod framing;
pub mod messages;
pub mod peer;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use messages::{GossipRequest, GossipResponse, MessageError};
pub use peer::{AddrError, PeerAddr};
pub use transport::{Connection, TransportError};
