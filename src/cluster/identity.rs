//! Persisted node identity and bootstrap records.
//!
//! `info.toml` records this node's administrative id and address; it is
//! written once at bootstrap or join and read on every later start.
//! `init.toml` is dropped into the data directory by `kvsql init` and
//! consumed (then removed) on the first start.

use crate::core::error::{KvsqlError, KvsqlResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INFO_FILE: &str = "info.toml";
pub const INIT_FILE: &str = "init.toml";

/// This node's id and address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: u64,
    pub address: String,
}

impl NodeIdentity {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(INFO_FILE)
    }

    /// Load and validate `<dir>/info.toml`.
    pub fn load(dir: &Path) -> KvsqlResult<Self> {
        let identity: Self = read_toml(&Self::path(dir))?;
        if identity.id == 0 {
            return Err(KvsqlError::invalid_argument("server ID is zero"));
        }
        if identity.address.is_empty() {
            return Err(KvsqlError::invalid_argument("server address is empty"));
        }
        Ok(identity)
    }

    pub fn write(&self, dir: &Path) -> KvsqlResult<()> {
        std::fs::create_dir_all(dir)?;
        write_toml(&Self::path(dir), self)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }
}

/// Bootstrap (`cluster` empty) or join (`cluster` lists existing members).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFile {
    pub address: String,
    #[serde(default)]
    pub cluster: Vec<String>,
}

impl InitFile {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(INIT_FILE)
    }

    /// Load `<dir>/init.toml` if it exists.
    pub fn load(dir: &Path) -> KvsqlResult<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let init: Self = read_toml(&path)?;
        if init.address.is_empty() {
            return Err(KvsqlError::invalid_argument("init address is empty"));
        }
        Ok(Some(init))
    }

    pub fn write(&self, dir: &Path) -> KvsqlResult<()> {
        std::fs::create_dir_all(dir)?;
        write_toml(&Self::path(dir), self)
    }

    pub fn remove(dir: &Path) -> KvsqlResult<()> {
        std::fs::remove_file(Self::path(dir))?;
        Ok(())
    }

    /// Whether this node starts a new cluster.
    pub fn is_bootstrap(&self) -> bool {
        self.cluster.is_empty()
    }
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> KvsqlResult<T> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| {
        KvsqlError::invalid_argument(format!("parse {}: {}", path.display(), e))
    })
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> KvsqlResult<()> {
    let content = toml::to_string(value)
        .map_err(|e| KvsqlError::invalid_argument(format!("encode {}: {}", path.display(), e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!NodeIdentity::exists(dir.path()));

        let identity = NodeIdentity {
            id: 3,
            address: "10.0.0.3:9000".to_string(),
        };
        identity.write(dir.path()).unwrap();
        assert_eq!(NodeIdentity::load(dir.path()).unwrap(), identity);

        NodeIdentity {
            id: 0,
            address: "x:1".to_string(),
        }
        .write(dir.path())
        .unwrap();
        assert!(NodeIdentity::load(dir.path()).is_err());
    }

    #[test]
    fn test_init_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InitFile::load(dir.path()).unwrap().is_none());

        let init = InitFile {
            address: "10.0.0.2:9000".to_string(),
            cluster: vec!["10.0.0.1:9000".to_string()],
        };
        init.write(dir.path()).unwrap();
        let loaded = InitFile::load(dir.path()).unwrap().unwrap();
        assert!(!loaded.is_bootstrap());
        assert_eq!(loaded, init);

        InitFile::remove(dir.path()).unwrap();
        assert!(InitFile::load(dir.path()).unwrap().is_none());
    }
}
