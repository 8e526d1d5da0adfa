//! Persistent storage using sled
//!
//! Only what must survive a restart lives here: the node id, the cluster
//! identity values and the addresses of peers seen in previous runs. The info
//! store itself is rebuilt from the network.

use cluster_gossip_core::keys::is_identity_key;
use cluster_gossip_core::{NodeId, Timestamp};
use sled::Db;
use std::path::Path;
use thiserror::Error;

const NODE_ID_KEY: &str = "node_id";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Not an identity key: {0}")]
    NotIdentityKey(String),
}

/// Storage backend for gossipd
pub struct Storage {
    db: Db,
    /// Metadata tree: node id and identity values
    metadata: sled::Tree,
    /// Bootstrap tree: peer address -> last seen stamp
    bootstrap: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let metadata = db.open_tree("metadata")?;
        let bootstrap = db.open_tree("bootstrap")?;

        Ok(Self {
            db,
            metadata,
            bootstrap,
        })
    }

    /// Node id persisted by a previous run
    pub fn node_id(&self) -> Result<Option<NodeId>, StorageError> {
        match self.metadata.get(NODE_ID_KEY)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_node_id(&self, node_id: NodeId) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(&node_id)?;
        self.metadata.insert(NODE_ID_KEY, value)?;
        Ok(())
    }

    /// Durable value of an identity key
    pub fn identity(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if !is_identity_key(key) {
            return Err(StorageError::NotIdentityKey(key.into()));
        }
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Record an identity value. The first value written wins; returns
    /// whether this call stored it.
    pub fn put_identity(&self, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        if !is_identity_key(key) {
            return Err(StorageError::NotIdentityKey(key.into()));
        }
        let swapped = self
            .metadata
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        if swapped.is_ok() {
            self.metadata.flush()?;
        }
        Ok(swapped.is_ok())
    }

    /// Remember a peer address for the next bootstrap
    pub fn record_peer(&self, addr: &str, seen_at: Timestamp) -> Result<(), StorageError> {
        self.bootstrap.insert(addr, seen_at.to_be_bytes().to_vec())?;
        Ok(())
    }

    /// Peer addresses from earlier runs, most recently seen first
    pub fn bootstrap_addrs(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = Vec::new();
        for result in self.bootstrap.iter() {
            let (key, value) = result?;
            let seen_at = value
                .as_ref()
                .try_into()
                .map(Timestamp::from_be_bytes)
                .unwrap_or(0);
            entries.push((seen_at, String::from_utf8_lossy(&key).into_owned()));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(entries.into_iter().map(|(_, addr)| addr).collect())
    }

    pub fn forget_peer(&self, addr: &str) -> Result<(), StorageError> {
        self.bootstrap.remove(addr)?;
        Ok(())
    }

    /// Keep only the `keep` most recently seen peer addresses. Returns how
    /// many were dropped.
    pub fn prune_peers(&self, keep: usize) -> Result<usize, StorageError> {
        let stale: Vec<String> = self.bootstrap_addrs()?.into_iter().skip(keep).collect();
        for addr in &stale {
            self.bootstrap.remove(addr.as_str())?;
        }
        Ok(stale.len())
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_gossip_core::keys::{KEY_CLUSTER_ID, KEY_SENTINEL};
    use tempfile::tempdir;

    #[test]
    fn test_node_id_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            assert_eq!(storage.node_id().unwrap(), None);
            storage.put_node_id(NodeId(42)).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.node_id().unwrap(), Some(NodeId(42)));
    }

    #[test]
    fn test_identity_first_write_wins() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        assert!(storage.put_identity(KEY_CLUSTER_ID, b"abc").unwrap());
        assert!(!storage.put_identity(KEY_CLUSTER_ID, b"xyz").unwrap());
        assert_eq!(
            storage.identity(KEY_CLUSTER_ID).unwrap().as_deref(),
            Some(&b"abc"[..])
        );
        assert_eq!(storage.identity(KEY_SENTINEL).unwrap(), None);
        assert!(matches!(
            storage.put_identity("node:1", b"x"),
            Err(StorageError::NotIdentityKey(_))
        ));
    }

    #[test]
    fn test_bootstrap_addrs_by_recency() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        storage.record_peer("10.0.0.1:9100", 5).unwrap();
        storage.record_peer("10.0.0.2:9100", 9).unwrap();
        storage.record_peer("10.0.0.3:9100", 7).unwrap();
        storage.record_peer("10.0.0.1:9100", 10).unwrap();
        storage.forget_peer("10.0.0.3:9100").unwrap();

        assert_eq!(
            storage.bootstrap_addrs().unwrap(),
            vec!["10.0.0.1:9100", "10.0.0.2:9100"]
        );
    }

    #[test]
    fn test_prune_peers_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        for i in 1..=5 {
            storage.record_peer(&format!("10.0.0.{i}:9100"), i).unwrap();
        }

        assert_eq!(storage.prune_peers(2).unwrap(), 3);
        assert_eq!(
            storage.bootstrap_addrs().unwrap(),
            vec!["10.0.0.5:9100", "10.0.0.4:9100"]
        );
        assert_eq!(storage.prune_peers(2).unwrap(), 0);
    }

    #[test]
    fn test_pruned_peers_stay_gone_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.record_peer("10.0.0.1:9100", 1).unwrap();
            storage.record_peer("10.0.0.2:9100", 2).unwrap();
            storage.prune_peers(1).unwrap();
            storage.flush().unwrap();
        }
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.bootstrap_addrs().unwrap(), vec!["10.0.0.2:9100"]);
    }
}
