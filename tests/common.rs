//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use async_trait::async_trait;
use kvsql::api::{self, ApiState};
use kvsql::cluster::{LocalCluster, Membership, NodeStore};
use kvsql::core::config::{Config, MembershipConfig};
use kvsql::core::error::{KvsqlError, KvsqlResult};
use kvsql::kv::retry::RetryPolicy;
use kvsql::kv::{Db, KeyValue, KvStore};
use kvsql::net::listener;
use kvsql::watch::broadcaster::DEFAULT_EVENT_CAPACITY;
use kvsql::watch::{Broadcaster, Notifier};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Minimal insecure configuration rooted at `data_dir`.
pub fn config_toml(data_dir: &Path, address: &str) -> String {
    format!(
        r#"
[node]
data_dir = "{}"
address = "{}"

[tls]
insecure = true

[storage]
retry_attempts = 3
retry_delay_ms = 10

[membership]
admin_timeout_secs = 1
leader_timeout_secs = 2
join_timeout_secs = 2
shutdown_timeout_secs = 2
"#,
        data_dir.display(),
        address
    )
}

pub fn config(data_dir: &Path, address: &str) -> Config {
    Config::from_toml(&config_toml(data_dir, address)).expect("valid test config")
}

/// Write a config file into `dir` and return its path.
pub fn write_config(dir: &Path, data_dir: &Path, address: &str) -> PathBuf {
    let path = dir.join("kvsql.toml");
    std::fs::write(&path, config_toml(data_dir, address)).expect("write config");
    path
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(10))
}

pub fn memory_db() -> Db {
    Db::open_in_memory(fast_retry()).expect("open in-memory db")
}

/// Store whose notifications go straight to a local broadcaster.
pub fn local_store() -> (KvStore, Arc<Broadcaster>) {
    let broadcaster = Arc::new(Broadcaster::new(DEFAULT_EVENT_CAPACITY));
    let store = KvStore::new(memory_db(), broadcaster.clone());
    (store, broadcaster)
}

/// Notifier that records every row it is given.
#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<KeyValue>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kv: &KeyValue) -> KvsqlResult<()> {
        self.seen.lock().push(kv.clone());
        Ok(())
    }
}

/// Notifier that always fails.
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _kv: &KeyValue) -> KvsqlResult<()> {
        Err(KvsqlError::http("connection refused"))
    }
}

pub fn membership_config() -> MembershipConfig {
    MembershipConfig {
        admin_timeout_secs: 1,
        leader_timeout_secs: 2,
        join_timeout_secs: 2,
        shutdown_timeout_secs: 2,
    }
}

/// Membership manager for `address` over a shared in-process cluster.
pub fn membership(cluster: &LocalCluster, address: &str) -> Arc<Membership> {
    let store = Arc::new(NodeStore::new(cluster.nodes()));
    Arc::new(Membership::new(
        address,
        store,
        Arc::new(cluster.clone()),
        &membership_config(),
    ))
}

/// A plaintext control-plane server on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: ApiState,
    shutdown: watch::Sender<bool>,
}

impl TestServer {
    pub async fn start(state: ApiState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(listener::serve(
            listener,
            None,
            api::router(state.clone()),
            shutdown_rx,
        ));
        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.state.shutdown.cancel();
    }
}

/// API state for a single-node cluster whose leader is `address`.
pub fn api_state(store: KvStore, broadcaster: Arc<Broadcaster>, address: &str) -> ApiState {
    let cluster = LocalCluster::bootstrap(1, address);
    ApiState {
        store,
        broadcaster,
        membership: membership(&cluster, address),
        engine_socket: PathBuf::from("/nonexistent/engine.sock"),
        shutdown: CancellationToken::new(),
    }
}
