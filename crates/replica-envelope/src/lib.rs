//! Replication envelope encoding
//!
//! Byte-compatible encoding of the command and snapshot envelopes exchanged
//! by the replication layer. Unknown fields are skipped by wire type so older
//! nodes can read envelopes written by newer ones.

pub mod codec;
pub mod raft;

pub use codec::Envelope;
pub use quick_protobuf::errors::Error as DecodeError;
pub use raft::{KeyValue, RaftCommand, RaftSnapshotData, RaftTombstone, RaftTruncatedState, Timestamp};
