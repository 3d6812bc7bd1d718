//! kvsql - etcd-style MVCC key-value store over a replicated SQL log.
//!
//! Every mutation appends a row to a single relational table, stamped with a
//! cluster-global revision. Reads reconstruct the state of the keyspace at
//! any retained revision; watchers receive committed rows in revision order.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   External etcd API layer                       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌──────────────────────────┐          ┌─────────────────────────────┐
//! │        KV Engine         │ ───────▶ │      Watch propagation      │
//! │ List │ Get │ CAS │ TTL   │  notify  │ leader broadcaster → streams│
//! └──────────────────────────┘          └─────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Replicated log (SQL)   │   Membership   │   mTLS tunnels      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Component lifecycle and maintenance loop
//! - [`core::time`] - TTL clock helpers
//! - [`core::error`] - Error types
//!
//! ## Key-value
//! - [`kv::db`] - Schema, named statements, retrying storage handle
//! - [`kv::store`] - List/Get/Update/Delete
//! - [`kv::compaction`] - TTL sweep and history compaction
//!
//! ## Watch
//! - [`watch::broadcaster`] - Local fan-out
//! - [`watch::notifier`] - Cross-node propagation to the leader
//! - [`watch::stream`] / [`watch::client`] - Upgraded watch streams
//!
//! ## Cluster
//! - [`cluster::membership`] - Voter rebalancing and graceful handover
//! - [`cluster::node_store`] - Discovery address book
//! - [`cluster::identity`] - Persisted node identity
//!
//! ## Networking
//! - [`net::tls`] - mTLS configuration
//! - [`net::upgrade`] / [`net::tunnel`] - Upgraded byte tunnels
//! - [`net::listener`] - Control-plane accept loop
//! - [`api`] - Control-plane HTTP endpoints
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Revisions are global and strictly increasing across all keys.
//! - At most one live row per key at any revision.
//! - Watch events reach each subscriber in commit order, or the subscriber
//!   is evicted and must replay.

// Core infrastructure
pub mod core;

// MVCC key-value engine
pub mod kv;

// Watch propagation
pub mod watch;

// Membership and topology
pub mod cluster;

// Networking
pub mod net;

// Control-plane HTTP API
pub mod api;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::error::{KvsqlError, KvsqlResult};
pub use self::core::{config, error, runtime, time};
pub use kv::{KeyValue, KvStore};
