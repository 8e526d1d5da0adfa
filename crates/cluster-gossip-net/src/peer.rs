//! Peer addressing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("address {0:?} is missing a port")]
    MissingPort(String),
    #[error("address {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("address {0:?} has an empty host")]
    EmptyHost(String),
}

/// A `host:port` gossip address. The host may be an IP literal or a name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddr(String);

impl PeerAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The literal socket address, when the host is an IP
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }

    /// Resolve through the system resolver
    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addr) = self.socket_addr() {
            return Ok(vec![addr]);
        }
        Ok(tokio::net::lookup_host(self.0.as_str()).await?.collect())
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.parse::<SocketAddr>().is_ok() {
            return Ok(Self(s.to_string()));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrError::EmptyHost(s.to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| AddrError::InvalidPort(s.to_string()))?;
        Ok(Self(s.to_string()))
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_and_names() {
        let literal: PeerAddr = "127.0.0.1:26257".parse().unwrap();
        assert_eq!(literal.socket_addr(), Some("127.0.0.1:26257".parse().unwrap()));

        let v6: PeerAddr = "[::1]:9000".parse().unwrap();
        assert!(v6.socket_addr().is_some());

        let named: PeerAddr = "roach-0.local:26257".parse().unwrap();
        assert_eq!(named.socket_addr(), None);
        assert_eq!(named.to_string(), "roach-0.local:26257");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "localhost".parse::<PeerAddr>(),
            Err(AddrError::MissingPort(_))
        ));
        assert!(matches!(
            "localhost:http".parse::<PeerAddr>(),
            Err(AddrError::InvalidPort(_))
        ));
        assert!(matches!(":80".parse::<PeerAddr>(), Err(AddrError::EmptyHost(_))));
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr: PeerAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(addr.resolve().await.unwrap(), vec!["127.0.0.1:1234".parse().unwrap()]);
    }
}
