//! Cluster topology and membership.
//!
//! This module contains:
//! - [`node_store`] - Atomic address book used for leader discovery
//! - [`identity`] - Persisted node identity and bootstrap/join records
//! - [`client`] - Administrative client seam onto the replicated log
//! - [`local`] - In-process replicated-log administration
//! - [`membership`] - Voter-count rebalancing and graceful handover

pub mod client;
pub mod identity;
pub mod local;
pub mod membership;
pub mod node_store;

pub use client::{find_leader, NodeClient, NodeConnector};
pub use identity::{InitFile, NodeIdentity};
pub use local::LocalCluster;
pub use membership::{AdjustOutcome, Membership};
pub use node_store::NodeStore;

use serde::{Deserialize, Serialize};

/// Membership role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Replicates the log and counts toward quorum.
    Voter,
    /// Replicates the log, does not vote.
    #[serde(rename = "stand-by")]
    StandBy,
    /// Does not replicate the log.
    Spare,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Voter => write!(f, "voter"),
            Self::StandBy => write!(f, "stand-by"),
            Self::Spare => write!(f, "spare"),
        }
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub address: String,
    pub role: NodeRole,
}

impl NodeInfo {
    pub fn new(id: u64, address: impl Into<String>, role: NodeRole) -> Self {
        Self {
            id,
            address: address.into(),
            role,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.role == NodeRole::Voter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_info_json() {
        let info = NodeInfo::new(2, "10.0.0.2:9000", NodeRole::StandBy);
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(
            json,
            r#"{"id":2,"address":"10.0.0.2:9000","role":"stand-by"}"#
        );
        let back: NodeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(NodeRole::Voter.to_string(), "voter");
        assert_eq!(NodeRole::Spare.to_string(), "spare");
    }
}
