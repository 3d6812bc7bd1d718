//! Membership Manager.
//!
//! Keeps the replicated group at three voters when it has at least three
//! members, and at a single voting leader when it has two. New members join
//! as spares and are promoted by [`Membership::adjust`] one at a time.
//!
//! Demotions go Voter → StandBy → Spare. A direct Voter → Spare change can
//! race the demoted node's election timer and trigger a spurious candidacy;
//! passing through StandBy lets the node learn it no longer votes first.

use crate::cluster::client::{find_leader, NodeClient, NodeConnector};
use crate::cluster::node_store::NodeStore;
use crate::cluster::{NodeInfo, NodeRole};
use crate::core::config::MembershipConfig;
use crate::core::error::{KvsqlError, KvsqlResult};
use crate::kv::Db;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Target number of voters.
pub const TARGET_VOTERS: usize = 3;

/// Result of one [`Membership::adjust`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// This node is not the leader; nothing was evaluated.
    NotLeader,
    /// Topology already satisfies the voter rules.
    Unchanged,
    /// A spare was promoted to voter.
    Promoted(u64),
    /// A voter was demoted to spare.
    Demoted(u64),
}

/// Cluster membership manager for the local node.
pub struct Membership {
    address: String,
    store: Arc<NodeStore>,
    connector: Arc<dyn NodeConnector>,
    admin_timeout: Duration,
    leader_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Membership {
    pub fn new(
        address: impl Into<String>,
        store: Arc<NodeStore>,
        connector: Arc<dyn NodeConnector>,
        config: &MembershipConfig,
    ) -> Self {
        Self {
            address: address.into(),
            store,
            connector,
            admin_timeout: config.admin_timeout(),
            leader_timeout: config.leader_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Address of the local node.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Full cluster topology as reported by the leader.
    pub async fn list(&self) -> KvsqlResult<Vec<NodeInfo>> {
        let leader = self.find_leader().await?;
        self.admin("list members", leader.cluster()).await
    }

    /// Join a new member. It always enters as a spare.
    pub async fn add(&self, id: u64, address: &str) -> KvsqlResult<()> {
        let leader = self.find_leader().await?;
        let info = NodeInfo::new(id, address, NodeRole::Spare);
        self.admin("join cluster", leader.add(info))
            .await
            .map_err(|e| KvsqlError::membership(format!("join cluster: {}", e)))?;
        tracing::info!(id, address, "member added as spare");
        Ok(())
    }

    /// Remove the member at `address`.
    pub async fn remove(&self, address: &str) -> KvsqlResult<()> {
        if address == self.address {
            return Err(KvsqlError::invalid_argument("can't remove ourselves"));
        }

        let leader = self.find_leader().await?;
        let servers = self.admin("list members", leader.cluster()).await?;
        let id = servers
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.id)
            .ok_or_else(|| {
                KvsqlError::invalid_argument(format!("no server exists with address {}", address))
            })?;

        self.admin("remove node", leader.remove(id))
            .await
            .map_err(|e| KvsqlError::membership(format!("remove node: {}", e)))?;
        tracing::info!(id, address, "member removed");
        Ok(())
    }

    /// Address of the current leader, or `None` if no leader is known.
    ///
    /// The local node is asked first; only when it does not know (spares
    /// never do) is the leader discovered through the node store.
    pub async fn leader(&self) -> KvsqlResult<Option<String>> {
        match self.local_leader().await {
            Ok(Some(leader)) => return Ok(Some(leader.address)),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "local leader lookup failed"),
        }

        let leader = self.find_leader().await?;
        let info = self.admin("get leader", leader.leader()).await?;
        Ok(info.map(|i| i.address))
    }

    /// One rebalancing step. Only the leader acts; everyone else returns
    /// [`AdjustOutcome::NotLeader`].
    ///
    /// At most one promotion or demotion is made per call. Any
    /// administrative failure aborts the call with an error and is retried
    /// on the next period.
    pub async fn adjust(&self) -> KvsqlResult<AdjustOutcome> {
        let leader = self.find_leader().await?;
        let info = self.admin("get leader", leader.leader()).await?;
        let leader_info = match info {
            Some(info) if info.address == self.address => info,
            _ => return Ok(AdjustOutcome::NotLeader),
        };

        let servers = self.admin("list members", leader.cluster()).await?;

        match servers.len() {
            0 | 1 => Ok(AdjustOutcome::Unchanged),
            2 => {
                let peer = servers
                    .iter()
                    .find(|s| s.address != leader_info.address && s.is_voter());
                match peer {
                    Some(peer) => {
                        self.demote(leader.as_ref(), peer.id).await?;
                        Ok(AdjustOutcome::Demoted(peer.id))
                    }
                    None => Ok(AdjustOutcome::Unchanged),
                }
            }
            _ => {
                let voters: Vec<&NodeInfo> = servers.iter().filter(|s| s.is_voter()).collect();
                if voters.len() < TARGET_VOTERS {
                    let spare = servers.iter().find(|s| s.role == NodeRole::Spare);
                    match spare {
                        Some(spare) => {
                            self.admin("promote", leader.assign(spare.id, NodeRole::Voter))
                                .await?;
                            tracing::info!(id = spare.id, address = %spare.address, "spare promoted to voter");
                            Ok(AdjustOutcome::Promoted(spare.id))
                        }
                        None => Ok(AdjustOutcome::Unchanged),
                    }
                } else if voters.len() > TARGET_VOTERS {
                    let extra = voters
                        .iter()
                        .find(|s| s.address != leader_info.address);
                    match extra {
                        Some(extra) => {
                            self.demote(leader.as_ref(), extra.id).await?;
                            Ok(AdjustOutcome::Demoted(extra.id))
                        }
                        None => Ok(AdjustOutcome::Unchanged),
                    }
                } else {
                    Ok(AdjustOutcome::Unchanged)
                }
            }
        }
    }

    /// Best-effort graceful handover before the process exits.
    ///
    /// If this node is a voter, a spare is promoted to replace it and
    /// leadership is transferred away if this node holds it. This node is
    /// demoted to spare only when a replacement was promoted. Bounded by the
    /// shutdown timeout; every failure is logged and swallowed.
    pub async fn shutdown(&self) {
        match tokio::time::timeout(self.shutdown_timeout, self.handover()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "membership handover incomplete"),
            Err(_) => tracing::warn!("membership handover timed out"),
        }
    }

    async fn handover(&self) -> KvsqlResult<()> {
        let leader = self.find_leader().await?;
        let servers = self.admin("list members", leader.cluster()).await?;

        let me = match servers.iter().find(|s| s.address == self.address) {
            Some(me) if me.is_voter() => me.clone(),
            _ => return Ok(()),
        };

        let mut replaced = false;
        for spare in servers
            .iter()
            .filter(|s| s.role == NodeRole::Spare && s.address != self.address)
        {
            match self
                .admin("promote", leader.assign(spare.id, NodeRole::Voter))
                .await
            {
                Ok(()) => {
                    tracing::info!(id = spare.id, "replacement voter promoted");
                    replaced = true;
                    break;
                }
                Err(e) => tracing::warn!(id = spare.id, error = %e, "replacement promotion failed"),
            }
        }

        let current = self.admin("get leader", leader.leader()).await?;
        let leader = match current {
            Some(info) if info.address == self.address => {
                self.admin("transfer leadership", leader.transfer(0)).await?;
                tracing::info!("leadership transferred");
                self.find_leader().await?
            }
            _ => leader,
        };

        // Without a replacement the voter count must not drop.
        if replaced {
            self.admin("demote", leader.assign(me.id, NodeRole::Spare))
                .await?;
            tracing::info!(id = me.id, "local node demoted to spare");
        }
        Ok(())
    }

    /// Rebuild the node store from the live topology, falling back to the
    /// `servers` table when the leader cannot be reached.
    pub async fn refresh_store(&self, db: &Db) -> KvsqlResult<usize> {
        let nodes = match self.list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!(error = %e, "topology unavailable, using servers table");
                let known = self.store.get();
                db.servers()
                    .await?
                    .into_iter()
                    .map(|(id, address)| {
                        let role = known
                            .iter()
                            .find(|n| n.address == address)
                            .map_or(NodeRole::Voter, |n| n.role);
                        NodeInfo::new(id, address, role)
                    })
                    .collect()
            }
        };

        if nodes.is_empty() {
            return Ok(self.store.len());
        }
        let count = nodes.len();
        self.store.set(nodes)?;
        Ok(count)
    }

    async fn demote(&self, leader: &dyn NodeClient, id: u64) -> KvsqlResult<()> {
        self.admin("demote to stand-by", leader.assign(id, NodeRole::StandBy))
            .await?;
        self.admin("demote to spare", leader.assign(id, NodeRole::Spare))
            .await?;
        tracing::info!(id, "voter demoted to spare");
        Ok(())
    }

    async fn local_leader(&self) -> KvsqlResult<Option<NodeInfo>> {
        let local = self
            .admin("connect to local node", self.connector.connect(&self.address))
            .await?;
        self.admin("get leader", local.leader()).await
    }

    async fn find_leader(&self) -> KvsqlResult<Arc<dyn NodeClient>> {
        find_leader(self.connector.as_ref(), &self.store, self.leader_timeout).await
    }

    async fn admin<T>(
        &self,
        operation: &str,
        call: impl Future<Output = KvsqlResult<T>>,
    ) -> KvsqlResult<T> {
        tokio::time::timeout(self.admin_timeout, call)
            .await
            .map_err(|_| KvsqlError::timeout(operation))?
    }
}
