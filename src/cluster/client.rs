//! Administrative client seam onto the replicated log.
//!
//! The consensus engine itself is external. Everything kvsql needs from it
//! for membership is expressed by [`NodeClient`] (one connection to one
//! member) and [`NodeConnector`] (how to open such a connection).

use crate::cluster::node_store::NodeStore;
use crate::cluster::{NodeInfo, NodeRole};
use crate::core::error::{KvsqlError, KvsqlResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Administrative connection to one cluster member.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Address this client is connected to.
    fn address(&self) -> &str;

    /// The leader as known by this member, if any.
    async fn leader(&self) -> KvsqlResult<Option<NodeInfo>>;

    /// Full member list with roles. Leader only.
    async fn cluster(&self) -> KvsqlResult<Vec<NodeInfo>>;

    /// Add a member. Leader only.
    async fn add(&self, node: NodeInfo) -> KvsqlResult<()>;

    /// Change a member's role. Leader only.
    async fn assign(&self, id: u64, role: NodeRole) -> KvsqlResult<()>;

    /// Remove a member. Leader only.
    async fn remove(&self, id: u64) -> KvsqlResult<()>;

    /// Hand leadership to `id`, or let the engine choose when `id == 0`.
    async fn transfer(&self, id: u64) -> KvsqlResult<()>;
}

/// Opens administrative connections.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, address: &str) -> KvsqlResult<Arc<dyn NodeClient>>;
}

/// Locate the current leader through the members listed in `store` and
/// return a client connected to it.
///
/// Members that cannot be reached, or that do not know the leader, are
/// skipped. The whole sweep is bounded by `timeout`.
pub async fn find_leader(
    connector: &dyn NodeConnector,
    store: &NodeStore,
    timeout: Duration,
) -> KvsqlResult<Arc<dyn NodeClient>> {
    let nodes = store.get();
    if nodes.is_empty() {
        return Err(KvsqlError::NoLeader);
    }

    let sweep = async {
        for node in nodes.iter() {
            match probe(connector, &node.address).await {
                Ok(Some(client)) => return Ok(client),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(address = %node.address, error = %e, "leader probe failed");
                }
            }
        }
        Err(KvsqlError::NoLeader)
    };

    tokio::time::timeout(timeout, sweep)
        .await
        .map_err(|_| KvsqlError::timeout("find leader"))?
}

async fn probe(
    connector: &dyn NodeConnector,
    address: &str,
) -> KvsqlResult<Option<Arc<dyn NodeClient>>> {
    let client = connector.connect(address).await?;
    let leader = match client.leader().await? {
        Some(leader) => leader,
        None => return Ok(None),
    };

    if leader.address == address {
        return Ok(Some(client));
    }

    // Confirm with the leader itself; the member's view may be stale.
    let client = connector.connect(&leader.address).await?;
    match client.leader().await? {
        Some(confirmed) if confirmed.address == leader.address => Ok(Some(client)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::local::LocalCluster;

    #[tokio::test]
    async fn test_find_leader_skips_unreachable() {
        let cluster = LocalCluster::bootstrap(1, "a:1");
        cluster.insert(NodeInfo::new(2, "b:1", NodeRole::Voter));
        cluster.set_unreachable("b:1", true);

        let store = NodeStore::new(cluster.nodes());
        // b is first in the store but unreachable
        store.set(cluster.nodes().into_iter().rev().collect()).unwrap();

        let leader = find_leader(&cluster, &store, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(leader.address(), "a:1");
    }

    #[tokio::test]
    async fn test_find_leader_via_follower() {
        let cluster = LocalCluster::bootstrap(1, "a:1");
        cluster.insert(NodeInfo::new(2, "b:1", NodeRole::Voter));
        let store = NodeStore::new(vec![NodeInfo::new(2, "b:1", NodeRole::Voter)]);

        let leader = find_leader(&cluster, &store, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(leader.address(), "a:1");
    }

    #[tokio::test]
    async fn test_find_leader_empty_store() {
        let cluster = LocalCluster::bootstrap(1, "a:1");
        let store = NodeStore::new(Vec::new());
        let result = find_leader(&cluster, &store, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(KvsqlError::NoLeader)));
    }

    #[tokio::test]
    async fn test_find_leader_all_unreachable() {
        let cluster = LocalCluster::bootstrap(1, "a:1");
        cluster.set_unreachable("a:1", true);
        let store = NodeStore::new(cluster.nodes());
        let result = find_leader(&cluster, &store, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(KvsqlError::NoLeader)));
    }
}
