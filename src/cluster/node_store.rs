//! Node address book.
//!
//! Readers take an `Arc` snapshot and never block writers for longer than a
//! pointer swap. Writers always replace the whole list, so a reader never
//! observes a half-applied topology change.

use crate::cluster::{NodeInfo, NodeRole};
use crate::core::error::KvsqlResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the persisted node store inside the data directory.
pub const NODE_STORE_FILE: &str = "servers.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeStoreFile {
    #[serde(default)]
    servers: Vec<NodeInfo>,
}

/// Shared, atomically replaced list of cluster members.
#[derive(Debug)]
pub struct NodeStore {
    nodes: RwLock<Arc<[NodeInfo]>>,
    path: Option<PathBuf>,
}

impl NodeStore {
    /// In-memory store.
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into()),
            path: None,
        }
    }

    /// Store backed by `<dir>/servers.toml`; loads the file if present.
    pub fn open(dir: &Path) -> KvsqlResult<Self> {
        let path = dir.join(NODE_STORE_FILE);
        let nodes = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: NodeStoreFile = toml::from_str(&content).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("parse {}: {}", path.display(), e),
                )
            })?;
            file.servers
        } else {
            Vec::new()
        };

        Ok(Self {
            nodes: RwLock::new(nodes.into()),
            path: Some(path),
        })
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<[NodeInfo]> {
        self.nodes.read().clone()
    }

    /// Replace the snapshot and persist it when file-backed.
    pub fn set(&self, nodes: Vec<NodeInfo>) -> KvsqlResult<()> {
        let snapshot: Arc<[NodeInfo]> = nodes.into();
        if let Some(ref path) = self.path {
            persist(path, &snapshot)?;
        }
        *self.nodes.write() = snapshot;
        Ok(())
    }

    /// Seed the store with bare addresses (ids are positional, roles unknown
    /// and recorded as Voter until a topology refresh corrects them).
    pub fn set_addresses(&self, addresses: &[String]) -> KvsqlResult<()> {
        let nodes = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| NodeInfo::new(i as u64 + 1, address.clone(), NodeRole::Voter))
            .collect();
        self.set(nodes)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.get().iter().map(|n| n.address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn persist(path: &Path, nodes: &[NodeInfo]) -> KvsqlResult<()> {
    let file = NodeStoreFile {
        servers: nodes.to_vec(),
    };
    let content = toml::to_string(&file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_stable_across_set() {
        let store = NodeStore::new(vec![NodeInfo::new(1, "a:1", NodeRole::Voter)]);
        let before = store.get();
        store
            .set(vec![
                NodeInfo::new(1, "a:1", NodeRole::Voter),
                NodeInfo::new(2, "b:1", NodeRole::Spare),
            ])
            .unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.addresses(), vec!["a:1", "b:1"]);
    }

    #[test]
    fn test_persisted_store_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = NodeStore::open(dir.path()).unwrap();
            assert!(store.is_empty());
            store
                .set_addresses(&["10.0.0.1:9000".to_string(), "10.0.0.2:9000".to_string()])
                .unwrap();
        }
        let store = NodeStore::open(dir.path()).unwrap();
        let nodes = store.get();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].id, 2);
        assert_eq!(nodes[1].address, "10.0.0.2:9000");
    }
}
