//! Relational schema and named statements.
//!
//! `Db` is the explicit storage handle owned by the runtime and cloned into
//! every component that needs it. All SQL it runs is drawn from the fixed
//! statement set below; query variants are selected through [`ListQuery`],
//! never assembled at runtime.
//!
//! # Revision allocation
//!
//! The `revision` table holds a single row whose `AUTOINCREMENT` id is the
//! current global revision. A mutation deletes that row and inserts a new
//! one inside the same `BEGIN IMMEDIATE` transaction as its `key_value`
//! insert, so no two writers can observe the same revision.

use crate::core::error::{KvsqlError, KvsqlResult};
use crate::kv::compaction::{self, CompactionStats};
use crate::kv::retry::{with_retry, RetryPolicy};
use crate::kv::{KeyMatch, KeyValue};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY NOT NULL,
    address TEXT NOT NULL,
    UNIQUE (address));
CREATE TABLE IF NOT EXISTS key_value (
    name TEXT NOT NULL,
    value BLOB,
    create_revision INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    ttl INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL,
    del INTEGER NOT NULL DEFAULT 0,
    old_value BLOB,
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_revision INTEGER NOT NULL DEFAULT 0);
CREATE INDEX IF NOT EXISTS name_idx ON key_value (name);
CREATE INDEX IF NOT EXISTS revision_idx ON key_value (revision);
CREATE TABLE IF NOT EXISTS revision (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    t TEXT);
INSERT INTO revision(t) SELECT NULL WHERE NOT EXISTS (SELECT 1 FROM revision);
";

macro_rules! select_kv {
    ($rest:literal) => {
        concat!(
            "SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, ",
            "kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del ",
            "FROM key_value kv ",
            $rest
        )
    };
}

// ?1 = prefix flag, ?2 = exact key or prefix stem.
macro_rules! name_matches {
    ($col:literal) => {
        concat!(
            "((?1 = 0 AND ",
            $col,
            " = ?2) OR (?1 = 1 AND substr(",
            $col,
            ", 1, length(?2)) = ?2))"
        )
    };
}

const POINT_SQL: &str = select_kv!(
    "WHERE kv.id = (SELECT kvi.id FROM key_value kvi WHERE kvi.name = ?1 \
     ORDER BY kvi.revision DESC LIMIT 1) AND kv.del = 0"
);

const LATEST_SQL: &str = concat!(
    select_kv!("JOIN (SELECT MAX(kvi.revision) AS revision FROM key_value kvi WHERE "),
    name_matches!("kvi.name"),
    " GROUP BY kvi.name) maxkv ON maxkv.revision = kv.revision \
     WHERE kv.del = 0 ORDER BY kv.name ASC LIMIT ?3"
);

const AT_REVISION_SQL: &str = concat!(
    select_kv!("JOIN (SELECT MAX(kvi.revision) AS revision FROM key_value kvi WHERE "),
    name_matches!("kvi.name"),
    " AND kvi.revision <= ?4 GROUP BY kvi.name) maxkv ON maxkv.revision = kv.revision \
     WHERE kv.del = 0 ORDER BY kv.name ASC LIMIT ?3"
);

const RESUME_SQL: &str = concat!(
    select_kv!("JOIN (SELECT MAX(kvi.revision) AS revision FROM key_value kvi WHERE "),
    name_matches!("kvi.name"),
    " AND kvi.revision <= ?4 AND kvi.name > ?5 GROUP BY kvi.name) maxkv \
     ON maxkv.revision = kv.revision WHERE kv.del = 0 ORDER BY kv.name ASC LIMIT ?3"
);

const SINCE_SQL: &str = concat!(
    select_kv!("WHERE "),
    name_matches!("kv.name"),
    " AND kv.revision >= ?3 ORDER BY kv.revision ASC"
);

const CURRENT_ROW_SQL: &str =
    select_kv!("WHERE kv.name = ?1 ORDER BY kv.revision DESC LIMIT 1");

const INSERT_KV_SQL: &str = "INSERT INTO key_value(name, value, old_value, old_revision, \
     create_revision, revision, ttl, version, del) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const CURRENT_REVISION_SQL: &str = "SELECT COALESCE(MAX(id), 0) FROM revision";
const CLEAR_REVISION_SQL: &str = "DELETE FROM revision";
const BUMP_REVISION_SQL: &str = "INSERT INTO revision(t) VALUES(NULL)";

pub(crate) const SWEEP_TTL_SQL: &str = "DELETE FROM key_value WHERE ttl > 0 AND ttl < ?1";
pub(crate) const COMPACT_SCAN_SQL: &str = "SELECT name, MAX(revision), COUNT(*) AS c \
     FROM key_value GROUP BY name HAVING c > 1 OR (c = 1 AND MAX(del) = 1)";
pub(crate) const COMPACT_DELETE_SQL: &str = "DELETE FROM key_value WHERE name = ?1 \
     AND (revision < ?2 OR (revision = ?2 AND del = 1))";

const INSERT_SERVER_SQL: &str = "INSERT INTO servers(id, address) VALUES(?1, ?2)";
const LIST_SERVERS_SQL: &str = "SELECT id, address FROM servers ORDER BY id ASC";
const MAX_SERVER_ID_SQL: &str = "SELECT COALESCE(MAX(id), 0) FROM servers";

/// Query variant used by `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListQuery {
    /// Exact key at the latest revision; at most one row.
    Point,
    /// Latest live row per matching name.
    Latest,
    /// Live row per matching name as of a revision.
    AtRevision,
    /// `AtRevision` restricted to names strictly after a resume key.
    Resume,
}

impl ListQuery {
    /// Pick the variant for a list request.
    pub fn select(key: &KeyMatch, revision: i64, resume: &str) -> Self {
        if !resume.is_empty() {
            Self::Resume
        } else if revision > 0 {
            Self::AtRevision
        } else if key.is_prefix() {
            Self::Latest
        } else {
            Self::Point
        }
    }

    /// The prepared statement text for this variant.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Point => POINT_SQL,
            Self::Latest => LATEST_SQL,
            Self::AtRevision => AT_REVISION_SQL,
            Self::Resume => RESUME_SQL,
        }
    }
}

/// A change applied by [`Db::mutate`].
#[derive(Debug, Clone, Copy)]
pub enum Change<'a> {
    /// Write a new live version; `ttl` is an absolute expiry or 0.
    Put { value: &'a [u8], ttl: i64 },
    /// Write a tombstone.
    Delete,
}

/// Storage handle over the replicated SQL database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.path)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Db {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>, retry: RetryPolicy) -> KvsqlResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn, retry, Some(path))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(retry: RetryPolicy) -> KvsqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, retry, None)
    }

    fn init(conn: Connection, retry: RetryPolicy, path: Option<PathBuf>) -> KvsqlResult<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = ?path, "database schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry,
            path,
        })
    }

    /// Database file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current global revision.
    pub async fn current_revision(&self) -> KvsqlResult<i64> {
        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            Ok(current_revision(&conn)?)
        })
        .await
    }

    /// Resolve the live rows matching `key` as of `revision` (0 = latest).
    ///
    /// Returns the rows ordered by name and the revision the caller can
    /// resume watching from.
    pub async fn list(
        &self,
        key: &str,
        revision: i64,
        limit: i64,
        resume: &str,
    ) -> KvsqlResult<(Vec<KeyValue>, i64)> {
        let key = KeyMatch::parse(key);
        let query = ListQuery::select(&key, revision, resume);
        let limit = if limit > 0 { limit } else { -1 };

        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(query.sql())?;
            let rows = match query {
                ListQuery::Point => stmt
                    .query_map(params![key.stem()], row_to_kv)?
                    .collect::<Result<Vec<_>, _>>()?,
                ListQuery::Latest => stmt
                    .query_map(params![key.is_prefix(), key.stem(), limit], row_to_kv)?
                    .collect::<Result<Vec<_>, _>>()?,
                ListQuery::AtRevision => stmt
                    .query_map(
                        params![key.is_prefix(), key.stem(), limit, revision],
                        row_to_kv,
                    )?
                    .collect::<Result<Vec<_>, _>>()?,
                ListQuery::Resume => {
                    let bound = if revision > 0 {
                        revision
                    } else {
                        current_revision(&conn)?
                    };
                    stmt.query_map(
                        params![key.is_prefix(), key.stem(), limit, bound, resume],
                        row_to_kv,
                    )?
                    .collect::<Result<Vec<_>, _>>()?
                }
            };

            let used = match rows.iter().map(|kv| kv.revision).max() {
                Some(max) => max,
                None => current_revision(&conn)?,
            };
            Ok((rows, used))
        })
        .await
    }

    /// Every row (tombstones included) matching `key` with
    /// `revision >= start`, in ascending revision order.
    pub async fn since(&self, key: &str, start: i64) -> KvsqlResult<Vec<KeyValue>> {
        let key = KeyMatch::parse(key);
        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(SINCE_SQL)?;
            let rows = stmt
                .query_map(params![key.is_prefix(), key.stem(), start], row_to_kv)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Apply a compare-and-swap mutation to `key`.
    ///
    /// With `expected > 0` the key must have a live row at exactly that
    /// revision. Returns the prior live row (if any) and the appended row.
    pub async fn mutate(
        &self,
        key: &str,
        change: Change<'_>,
        expected: i64,
    ) -> KvsqlResult<(Option<KeyValue>, KeyValue)> {
        with_retry(&self.retry, || {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = apply_change(&tx, key, change, expected)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    /// Run the TTL sweep and history compaction in one transaction.
    pub async fn compact(&self, now: i64) -> KvsqlResult<CompactionStats> {
        with_retry(&self.retry, || {
            let mut conn = self.conn.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stats = compaction::run(&tx, now)?;
            tx.commit()?;
            Ok(stats)
        })
        .await
    }

    /// Record a cluster member.
    pub async fn add_server(&self, id: u64, address: &str) -> KvsqlResult<()> {
        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            conn.prepare_cached(INSERT_SERVER_SQL)?
                .execute(params![id as i64, address])?;
            Ok(())
        })
        .await
    }

    /// All recorded cluster members as `(id, address)`, ordered by id.
    pub async fn servers(&self) -> KvsqlResult<Vec<(u64, String)>> {
        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(LIST_SERVERS_SQL)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Highest recorded server id, 0 when none.
    pub async fn max_server_id(&self) -> KvsqlResult<u64> {
        with_retry(&self.retry, || {
            let conn = self.conn.lock();
            let id: i64 = conn
                .prepare_cached(MAX_SERVER_ID_SQL)?
                .query_row([], |row| row.get(0))?;
            Ok(id as u64)
        })
        .await
    }
}

fn apply_change(
    tx: &Transaction<'_>,
    key: &str,
    change: Change<'_>,
    expected: i64,
) -> KvsqlResult<(Option<KeyValue>, KeyValue)> {
    let live = tx
        .prepare_cached(CURRENT_ROW_SQL)?
        .query_row(params![key], row_to_kv)
        .optional()?
        .filter(KeyValue::is_live);

    if expected > 0 {
        match live {
            None => {
                return Err(KvsqlError::NotFound {
                    key: key.to_string(),
                })
            }
            Some(ref current) if current.revision != expected => {
                return Err(KvsqlError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    actual: current.revision,
                })
            }
            Some(_) => {}
        }
    }

    let revision = next_revision(tx)?;
    let (value, ttl, del) = match change {
        Change::Put { value, ttl } => (value.to_vec(), ttl, false),
        Change::Delete => (Vec::new(), 0, true),
    };

    let mut row = KeyValue {
        id: 0,
        key: key.to_string(),
        value,
        old_value: live.as_ref().map(|p| p.value.clone()).unwrap_or_default(),
        old_revision: live.as_ref().map_or(0, |p| p.revision),
        create_revision: live.as_ref().map_or(revision, |p| p.create_revision),
        revision,
        ttl,
        version: live.as_ref().map_or(1, |p| p.version + 1),
        del,
    };

    tx.prepare_cached(INSERT_KV_SQL)?.execute(params![
        row.key,
        row.value,
        row.old_value,
        row.old_revision,
        row.create_revision,
        row.revision,
        row.ttl,
        row.version,
        row.del,
    ])?;
    row.id = tx.last_insert_rowid();

    Ok((live, row))
}

fn current_revision(conn: &Connection) -> rusqlite::Result<i64> {
    conn.prepare_cached(CURRENT_REVISION_SQL)?
        .query_row([], |row| row.get(0))
}

fn next_revision(tx: &Transaction<'_>) -> rusqlite::Result<i64> {
    tx.prepare_cached(CLEAR_REVISION_SQL)?.execute([])?;
    tx.prepare_cached(BUMP_REVISION_SQL)?.execute([])?;
    Ok(tx.last_insert_rowid())
}

fn row_to_kv(row: &Row<'_>) -> rusqlite::Result<KeyValue> {
    Ok(KeyValue {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
        old_value: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
        old_revision: row.get(4)?,
        create_revision: row.get(5)?,
        revision: row.get(6)?,
        ttl: row.get(7)?,
        version: row.get(8)?,
        del: row.get::<_, i64>(9)? != 0,
    })
}
