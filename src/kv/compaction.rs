//! TTL sweep and history compaction.
//!
//! Both passes run inside the caller's transaction:
//!
//! 1. **TTL sweep**: rows with `ttl > 0 AND ttl < now` are hard-deleted.
//!    Expired rows carry no watch obligation, so no tombstone is written.
//! 2. **History compaction**: for every name with more than one row, or a
//!    single tombstone row, all rows below the max revision are deleted,
//!    and the max-revision row too when it is a tombstone.
//!
//! The live frontier of every key is left intact.

use crate::kv::db::{COMPACT_DELETE_SQL, COMPACT_SCAN_SQL, SWEEP_TTL_SQL};
use rusqlite::{params, Transaction};
use serde::{Deserialize, Serialize};

/// Rows removed by one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    /// Rows removed by the TTL sweep.
    pub expired: usize,
    /// Superseded or tombstone rows removed by history compaction.
    pub compacted: usize,
    /// Distinct names touched by history compaction.
    pub names: usize,
}

impl CompactionStats {
    /// Total rows removed.
    pub fn total(&self) -> usize {
        self.expired + self.compacted
    }
}

pub(crate) fn run(tx: &Transaction<'_>, now: i64) -> rusqlite::Result<CompactionStats> {
    let expired = tx.prepare_cached(SWEEP_TTL_SQL)?.execute(params![now])?;

    let candidates = {
        let mut stmt = tx.prepare_cached(COMPACT_SCAN_SQL)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut compacted = 0;
    let mut delete = tx.prepare_cached(COMPACT_DELETE_SQL)?;
    for (name, max_revision) in &candidates {
        compacted += delete.execute(params![name, max_revision])?;
    }

    Ok(CompactionStats {
        expired,
        compacted,
        names: candidates.len(),
    })
}

#[cfg(test)]
mod tests {
    use crate::kv::db::{Change, Db};
    use crate::kv::retry::RetryPolicy;

    fn db() -> Db {
        Db::open_in_memory(RetryPolicy::default()).unwrap()
    }

    #[tokio::test]
    async fn test_history_compaction_keeps_latest() {
        let db = db();
        for v in [b"1", b"2", b"3"] {
            db.mutate("/a", Change::Put { value: v, ttl: 0 }, 0)
                .await
                .unwrap();
        }
        let stats = db.compact(0).await.unwrap();
        assert_eq!(stats.compacted, 2);
        assert_eq!(stats.names, 1);

        let rows = db.since("/a", 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, b"3");
        assert_eq!(rows[0].version, 3);
    }

    #[tokio::test]
    async fn test_trailing_tombstone_removes_everything() {
        let db = db();
        db.mutate("/a", Change::Put { value: b"1", ttl: 0 }, 0)
            .await
            .unwrap();
        db.mutate("/a", Change::Delete, 0).await.unwrap();

        let stats = db.compact(0).await.unwrap();
        assert_eq!(stats.compacted, 2);
        assert!(db.since("/a", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_live_row_untouched() {
        let db = db();
        db.mutate("/a", Change::Put { value: b"1", ttl: 0 }, 0)
            .await
            .unwrap();
        let stats = db.compact(0).await.unwrap();
        assert_eq!(stats.total(), 0);
        assert_eq!(db.since("/a", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_sweep_uses_now() {
        let db = db();
        db.mutate("/expired", Change::Put { value: b"x", ttl: 100 }, 0)
            .await
            .unwrap();
        db.mutate("/future", Change::Put { value: b"x", ttl: 500 }, 0)
            .await
            .unwrap();
        db.mutate("/forever", Change::Put { value: b"x", ttl: 0 }, 0)
            .await
            .unwrap();

        let stats = db.compact(200).await.unwrap();
        assert_eq!(stats.expired, 1);

        let (items, _) = db.list("/%", 0, 0, "").await.unwrap();
        let keys: Vec<_> = items.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/forever", "/future"]);
    }
}
