//! KV Engine operations.
//!
//! `KvStore` pairs the storage handle with a [`Notifier`]. Mutations are
//! durable before the notifier runs; a notification failure is reported as
//! [`KvsqlError::Notification`] and means "write succeeded, notification
//! uncertain".

use crate::core::error::{KvsqlError, KvsqlResult};
use crate::core::time::{ttl_deadline, unix_now};
use crate::kv::compaction::CompactionStats;
use crate::kv::db::{Change, Db};
use crate::kv::{KeyValue, WILDCARD};
use crate::watch::notifier::Notifier;
use std::sync::Arc;

/// MVCC key-value store.
#[derive(Clone)]
pub struct KvStore {
    db: Db,
    notifier: Arc<dyn Notifier>,
}

impl KvStore {
    pub fn new(db: Db, notifier: Arc<dyn Notifier>) -> Self {
        Self { db, notifier }
    }

    /// Underlying storage handle.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// List live keys matching `key` (exact, or prefix with a trailing `%`)
    /// as of `revision` (0 = latest).
    ///
    /// `limit <= 0` means unlimited. A non-empty `resume` returns only names
    /// strictly greater than it. The second element is the highest revision
    /// among the results, or the current revision when there are none.
    pub async fn list(
        &self,
        revision: i64,
        limit: i64,
        key: &str,
        resume: &str,
    ) -> KvsqlResult<(Vec<KeyValue>, i64)> {
        self.db.list(key, revision, limit, resume).await
    }

    /// Latest live value of an exact key.
    pub async fn get(&self, key: &str) -> KvsqlResult<Option<KeyValue>> {
        let (items, _) = self.list(0, 1, key, "").await?;
        Ok(items.into_iter().next())
    }

    /// Compare-and-swap write.
    ///
    /// `expected == 0` is a blind write. `ttl_secs > 0` stores an absolute
    /// expiry. Returns the previous live row and the new row.
    pub async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected: i64,
        ttl_secs: i64,
    ) -> KvsqlResult<(Option<KeyValue>, KeyValue)> {
        let ttl = ttl_deadline(unix_now(), ttl_secs);
        let (previous, current) = self
            .db
            .mutate(key, Change::Put { value, ttl }, expected)
            .await?;

        tracing::trace!(key, revision = current.revision, "key updated");
        self.notify(&current).await?;
        Ok((previous, current))
    }

    /// Compare-and-swap delete, writing a tombstone.
    ///
    /// Range deletes are unsupported: a key ending in `%` is rejected with
    /// `InvalidArgument` before storage is touched.
    pub async fn delete(&self, key: &str, expected: i64) -> KvsqlResult<Option<KeyValue>> {
        if key.ends_with(WILDCARD) {
            return Err(KvsqlError::invalid_argument(format!(
                "range delete is not supported: {}",
                key
            )));
        }

        let (previous, tombstone) = self.db.mutate(key, Change::Delete, expected).await?;

        tracing::trace!(key, revision = tombstone.revision, "key deleted");
        self.notify(&tombstone).await?;
        Ok(previous)
    }

    /// Every row for `key` with `revision >= start`, oldest first.
    pub async fn replay(&self, key: &str, start: i64) -> KvsqlResult<Vec<KeyValue>> {
        self.db.since(key, start).await
    }

    /// One TTL sweep and history compaction pass at the current time.
    pub async fn compact(&self) -> KvsqlResult<CompactionStats> {
        self.db.compact(unix_now()).await
    }

    async fn notify(&self, kv: &KeyValue) -> KvsqlResult<()> {
        self.notifier.notify(kv).await.map_err(|e| {
            tracing::warn!(key = %kv.key, revision = kv.revision, error = %e, "watch notification failed");
            match e {
                KvsqlError::Notification { .. } => e,
                other => KvsqlError::notification(other.to_string()),
            }
        })
    }
}
