//! Error types for the gossip core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Gossip core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Writes require a non-empty key
    #[error("empty key")]
    EmptyKey,

    /// Writes require a strictly positive TTL
    #[error("invalid ttl for key {key:?}: must be greater than zero")]
    InvalidTtl { key: String },

    /// A cluster identity key already carries a different durable value
    #[error("identity conflict on {key:?}: pinned {pinned}, offered {offered}")]
    IdentityConflict {
        key: String,
        pinned: String,
        offered: String,
    },

    /// Value under a well-known key could not be interpreted
    #[error("malformed value for key {0:?}")]
    MalformedValue(String),
}
