//! Configuration for gossipd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// gossipd - cluster gossip daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "gossipd")]
#[command(about = "Cluster gossip daemon: info exchange, peer links and bootstrap")]
pub struct Config {
    /// Node id; defaults to the persisted id, or a fresh random one
    #[arg(long, env = "GOSSIP_NODE_ID")]
    pub node_id: Option<u32>,

    /// Listen address for gossip connections
    #[arg(short, long, default_value = "0.0.0.0:9100")]
    pub listen: SocketAddr,

    /// Address other nodes should dial (host:port); defaults to the bound address
    #[arg(long, env = "GOSSIP_ADVERTISE")]
    pub advertise: Option<String>,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/gossipd")]
    pub data_dir: PathBuf,

    /// Bootstrap addresses (comma-separated host:port). Empty means this
    /// node may found a new cluster.
    #[arg(long, value_delimiter = ',', env = "GOSSIP_JOIN")]
    pub join: Vec<String>,

    /// Outgoing links to keep open
    #[arg(long, default_value = "3")]
    pub max_fanout: usize,

    /// Incoming links served at once
    #[arg(long, default_value = "8")]
    pub max_incoming: usize,

    /// Delay between exchange rounds on one link
    #[arg(long, default_value = "1000")]
    pub gossip_interval_ms: u64,

    /// Connection manager scheduler period
    #[arg(long, default_value = "500")]
    pub tick_interval_ms: u64,

    /// Deadline for every connect, send and receive
    #[arg(long, default_value = "3000")]
    pub rpc_timeout_ms: u64,

    /// TTL of this node's descriptor
    #[arg(long, default_value = "60")]
    pub node_ttl_secs: u64,

    /// TTL of the cluster id and sentinel infos
    #[arg(long, default_value = "600")]
    pub identity_ttl_secs: u64,

    /// Drop incoming infos that travelled more hops than this
    #[arg(long)]
    pub max_hops: Option<u32>,

    /// Maximum infos per exchange delta
    #[arg(long, default_value = "1000")]
    pub max_delta_infos: usize,

    /// First reconnect delay
    #[arg(long, default_value = "100")]
    pub backoff_base_ms: u64,

    /// Reconnect delay cap
    #[arg(long, default_value = "10000")]
    pub backoff_max_ms: u64,

    /// Peer addresses kept on disk for the next bootstrap
    #[arg(long, default_value = "64")]
    pub max_persisted_peers: usize,

    /// Consecutive failures before a link gives up
    #[arg(long, default_value = "5")]
    pub max_link_failures: u32,

    /// Node attributes published in the descriptor (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub attrs: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id == Some(0) {
            anyhow::bail!("Node id 0 is reserved");
        }
        if self.max_fanout == 0 {
            anyhow::bail!("max-fanout must be at least 1");
        }
        if self.max_incoming == 0 {
            anyhow::bail!("max-incoming must be at least 1");
        }
        if self.max_hops == Some(0) {
            anyhow::bail!("max-hops must be at least 1");
        }
        if self.max_persisted_peers == 0 {
            anyhow::bail!("max-persisted-peers must be at least 1");
        }
        if self.max_delta_infos == 0 {
            anyhow::bail!("max-delta-infos must be at least 1");
        }
        if self.gossip_interval_ms == 0 || self.tick_interval_ms == 0 || self.rpc_timeout_ms == 0
        {
            anyhow::bail!("Intervals and timeouts must be non-zero");
        }
        if self.node_ttl_secs == 0 || self.identity_ttl_secs == 0 {
            anyhow::bail!("TTLs must be non-zero");
        }
        if self.backoff_base_ms == 0 || self.backoff_max_ms < self.backoff_base_ms {
            anyhow::bail!("Backoff must satisfy 0 < base <= max");
        }
        if self.max_link_failures == 0 {
            anyhow::bail!("max-link-failures must be at least 1");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node_ttl_secs)
    }

    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_ttl_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// A node with nowhere to join is allowed to found a cluster
    pub fn may_found(&self) -> bool {
        self.join.iter().all(|addr| addr.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("gossipd").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_validate() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert!(config.may_found());
        assert_eq!(config.gossip_interval(), Duration::from_secs(1));
        assert_eq!(config.max_fanout, 3);
    }

    #[test]
    fn test_join_list() {
        let config = parse(&["--join", "10.0.0.1:9100,node-b.local:9100"]);
        assert_eq!(config.join, vec!["10.0.0.1:9100", "node-b.local:9100"]);
        assert!(!config.may_found());
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(parse(&["--max-fanout", "0"]).validate().is_err());
        assert!(parse(&["--node-ttl-secs", "0"]).validate().is_err());
        assert!(parse(&["--gossip-interval-ms", "0"]).validate().is_err());
        assert!(parse(&["--node-id", "0"]).validate().is_err());
        assert!(parse(&["--backoff-base-ms", "500", "--backoff-max-ms", "100"])
            .validate()
            .is_err());
        assert!(parse(&["--log-format", "xml"]).validate().is_err());
        assert!(parse(&["--max-persisted-peers", "0"]).validate().is_err());
    }

    #[test]
    fn test_max_hops_bounds() {
        // Zero would drop every info received from a peer
        assert!(parse(&["--max-hops", "0"]).validate().is_err());
        parse(&["--max-hops", "1"]).validate().unwrap();
        assert_eq!(parse(&[]).max_hops, None);
    }
}
