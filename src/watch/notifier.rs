//! Watch notification sinks.

use crate::api::client::ApiClient;
use crate::cluster::Membership;
use crate::core::error::{KvsqlError, KvsqlResult};
use crate::kv::KeyValue;
use crate::watch::Broadcaster;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives every committed row after it is durable.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kv: &KeyValue) -> KvsqlResult<()>;
}

/// Routes notifications to the leader's broadcaster.
///
/// Watchers only ever attach to the leader, so a row committed here is
/// published directly when this node leads and forwarded over HTTP
/// otherwise.
pub struct ClusterNotifier {
    broadcaster: Arc<Broadcaster>,
    membership: Arc<Membership>,
    api: ApiClient,
}

impl ClusterNotifier {
    pub fn new(broadcaster: Arc<Broadcaster>, membership: Arc<Membership>, api: ApiClient) -> Self {
        Self {
            broadcaster,
            membership,
            api,
        }
    }
}

#[async_trait]
impl Notifier for ClusterNotifier {
    async fn notify(&self, kv: &KeyValue) -> KvsqlResult<()> {
        let leader = self
            .membership
            .leader()
            .await
            .map_err(|e| KvsqlError::notification(format!("failed to find leader: {}", e)))?
            .ok_or_else(|| KvsqlError::notification("failed to find leader"))?;

        if leader == self.membership.address() {
            self.broadcaster.publish(kv.clone()).await
        } else {
            self.api.notify(&leader, kv).await
        }
    }
}
