//! In-process replicated-log administration.
//!
//! `LocalCluster` models the engine's membership state machine in memory:
//! a member list with roles and a single leader. It backs standalone
//! deployments (a one-node cluster embedded in the process) and lets the
//! membership logic be exercised without a real consensus engine.
//!
//! Behaviour mirrors the engine's administrative API:
//! - only the leader answers `cluster`, `add`, `assign`, `remove` and
//!   `transfer`; other members reply "not leader"
//! - spare members do not track the leader
//! - the leader cannot be demoted or removed; it must transfer first

use crate::cluster::client::{NodeClient, NodeConnector};
use crate::cluster::{NodeInfo, NodeRole};
use crate::core::error::{KvsqlError, KvsqlResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    nodes: Vec<NodeInfo>,
    leader: Option<u64>,
    unreachable: HashSet<String>,
    failing_assign: HashSet<u64>,
}

impl State {
    fn node(&self, id: u64) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn by_address(&self, address: &str) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.address == address)
    }

    fn leader_info(&self) -> Option<NodeInfo> {
        self.leader.and_then(|id| self.node(id).cloned())
    }

    fn require_leader(&self, address: &str) -> KvsqlResult<u64> {
        match self.leader_info() {
            Some(leader) if leader.address == address => Ok(leader.id),
            _ => Err(KvsqlError::membership(format!("{} is not leader", address))),
        }
    }
}

/// Shared in-memory cluster topology.
#[derive(Debug, Clone, Default)]
pub struct LocalCluster {
    state: Arc<Mutex<State>>,
}

impl LocalCluster {
    /// A cluster with a single voter that is also the leader.
    pub fn bootstrap(id: u64, address: impl Into<String>) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.state.lock();
            state.nodes.push(NodeInfo::new(id, address, NodeRole::Voter));
            state.leader = Some(id);
        }
        cluster
    }

    /// Insert a member directly, bypassing the leader.
    pub fn insert(&self, node: NodeInfo) {
        self.state.lock().nodes.push(node);
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().nodes.clone()
    }

    pub fn leader(&self) -> Option<NodeInfo> {
        self.state.lock().leader_info()
    }

    pub fn role_of(&self, address: &str) -> Option<NodeRole> {
        self.state.lock().by_address(address).map(|n| n.role)
    }

    pub fn voters(&self) -> usize {
        self.state.lock().nodes.iter().filter(|n| n.is_voter()).count()
    }

    /// Force leadership onto `id`.
    pub fn set_leader(&self, id: u64) {
        self.state.lock().leader = Some(id);
    }

    /// Make connections to `address` fail.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    /// Make role assignments targeting `id` fail.
    pub fn fail_assign(&self, id: u64, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_assign.insert(id);
        } else {
            state.failing_assign.remove(&id);
        }
    }

    /// Administrative client for the member at `address`.
    pub fn client(&self, address: impl Into<String>) -> LocalClient {
        LocalClient {
            cluster: self.clone(),
            address: address.into(),
        }
    }

    fn check_reachable(&self, address: &str) -> KvsqlResult<()> {
        let state = self.state.lock();
        if state.unreachable.contains(address) {
            return Err(KvsqlError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} unreachable", address),
            )));
        }
        if state.by_address(address).is_none() {
            return Err(KvsqlError::membership(format!("{} is not a member", address)));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeConnector for LocalCluster {
    async fn connect(&self, address: &str) -> KvsqlResult<Arc<dyn NodeClient>> {
        self.check_reachable(address)?;
        Ok(Arc::new(self.client(address)))
    }
}

/// Connection to one member of a [`LocalCluster`].
#[derive(Debug, Clone)]
pub struct LocalClient {
    cluster: LocalCluster,
    address: String,
}

#[async_trait]
impl NodeClient for LocalClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn leader(&self) -> KvsqlResult<Option<NodeInfo>> {
        self.cluster.check_reachable(&self.address)?;
        let state = self.cluster.state.lock();
        match state.by_address(&self.address) {
            Some(me) if me.role == NodeRole::Spare => Ok(None),
            _ => Ok(state.leader_info()),
        }
    }

    async fn cluster(&self) -> KvsqlResult<Vec<NodeInfo>> {
        self.cluster.check_reachable(&self.address)?;
        // Followers answer with the replicated topology.
        Ok(self.cluster.state.lock().nodes.clone())
    }

    async fn add(&self, node: NodeInfo) -> KvsqlResult<()> {
        self.cluster.check_reachable(&self.address)?;
        let mut state = self.cluster.state.lock();
        state.require_leader(&self.address)?;
        if state.node(node.id).is_some() {
            return Err(KvsqlError::membership(format!("a server with ID {} already exists", node.id)));
        }
        if state.by_address(&node.address).is_some() {
            return Err(KvsqlError::membership(format!(
                "a server with address {} already exists",
                node.address
            )));
        }
        state.nodes.push(node);
        Ok(())
    }

    async fn assign(&self, id: u64, role: NodeRole) -> KvsqlResult<()> {
        self.cluster.check_reachable(&self.address)?;
        let mut state = self.cluster.state.lock();
        let leader = state.require_leader(&self.address)?;
        if state.failing_assign.contains(&id) {
            return Err(KvsqlError::membership(format!("assign {} failed", id)));
        }
        if id == leader && role != NodeRole::Voter {
            return Err(KvsqlError::membership("the leader cannot be demoted"));
        }
        match state.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.role = role;
                Ok(())
            }
            None => Err(KvsqlError::membership(format!("no server with ID {}", id))),
        }
    }

    async fn remove(&self, id: u64) -> KvsqlResult<()> {
        self.cluster.check_reachable(&self.address)?;
        let mut state = self.cluster.state.lock();
        let leader = state.require_leader(&self.address)?;
        if id == leader {
            return Err(KvsqlError::membership("the leader cannot be removed"));
        }
        let before = state.nodes.len();
        state.nodes.retain(|n| n.id != id);
        if state.nodes.len() == before {
            return Err(KvsqlError::membership(format!("no server with ID {}", id)));
        }
        Ok(())
    }

    async fn transfer(&self, id: u64) -> KvsqlResult<()> {
        self.cluster.check_reachable(&self.address)?;
        let mut state = self.cluster.state.lock();
        let leader = state.require_leader(&self.address)?;
        let target = if id == 0 {
            state
                .nodes
                .iter()
                .find(|n| n.id != leader && n.is_voter() && !state.unreachable.contains(&n.address))
                .map(|n| n.id)
                .ok_or_else(|| KvsqlError::membership("no voter available for transfer"))?
        } else {
            match state.node(id) {
                Some(node) if node.is_voter() => id,
                _ => return Err(KvsqlError::membership(format!("{} is not a voter", id))),
            }
        };
        state.leader = Some(target);
        Ok(())
    }
}
