//! gossipd - cluster gossip daemon
//!
//! This daemon provides:
//! - A local facade over the info store with change subscriptions
//! - Bidirectional exchange rounds with peers
//! - Outgoing link management with backoff and fanout limits
//! - Bootstrap, identity recovery and founder election
//! - Durable node id, cluster identity and peer addresses

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod exchange;
pub mod gossip;
pub mod manager;
pub mod server;
pub mod storage;

pub use bootstrap::{BootstrapOutcome, Bootstrapper, Resolver};
pub use client::{Backoff, Link, LinkState, LinkStatus};
pub use config::Config;
pub use exchange::{Exchange, ExchangeError, RoundOutcome};
pub use gossip::{Gossip, GossipError, KeyPattern, SubscriptionId};
pub use manager::{ConnectionManager, LinkTable};
pub use server::{Server, ServerError, ShutdownHandle};
pub use storage::Storage;
