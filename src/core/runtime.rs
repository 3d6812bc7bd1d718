//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: storage → node store → identity → broadcaster →
//!   membership → listener → maintenance
//! - Shutdown order: membership handover → listener → maintenance →
//!   broadcaster → storage

use crate::api::{self, ApiClient, ApiState};
use crate::cluster::{InitFile, LocalCluster, Membership, NodeConnector, NodeIdentity, NodeStore};
use crate::core::config::{Config, MaintenanceConfig};
use crate::kv::retry::RetryPolicy;
use crate::kv::{Db, KvStore};
use crate::net::listener;
use crate::net::tls::TlsConfig;
use crate::net::{PlainTransport, Transport};
use crate::watch::broadcaster::DEFAULT_EVENT_CAPACITY;
use crate::watch::{Broadcaster, ClusterNotifier};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Time allowed for the listener task to wind down.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    Stopping,
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub storage: ComponentHealth,
    pub membership: ComponentHealth,
    pub watch: ComponentHealth,
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            storage: ComponentHealth::Starting,
            membership: ComponentHealth::Starting,
            watch: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        [self.storage, self.membership, self.watch, self.listener]
            .iter()
            .all(|h| *h == ComponentHealth::Healthy)
    }
}

/// Handles owned by a started runtime.
#[derive(Clone)]
pub struct Services {
    pub identity: NodeIdentity,
    pub db: Db,
    pub node_store: Arc<NodeStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub membership: Arc<Membership>,
    pub store: KvStore,
    pub transport: Arc<dyn Transport>,
}

/// kvsql runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,

    /// Administrative connector onto the replicated log. `None` runs the
    /// embedded single-process engine.
    connector: Option<Arc<dyn NodeConnector>>,

    services: Option<Services>,

    health: RuntimeHealth,

    running: Arc<AtomicBool>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Parent token of every watch subscription.
    watch_cancel: CancellationToken,

    local_addr: Option<SocketAddr>,
    listener_handle: Option<JoinHandle<crate::core::error::KvsqlResult<()>>>,
    maintenance_handle: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a runtime backed by the embedded engine.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            connector: None,
            services: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            watch_cancel: CancellationToken::new(),
            local_addr: None,
            listener_handle: None,
            maintenance_handle: None,
        })
    }

    /// Create a runtime administering an already running engine through
    /// `connector`.
    pub fn with_connector(config: Config, connector: Arc<dyn NodeConnector>) -> Result<Self> {
        let mut runtime = Self::new(config)?;
        runtime.connector = Some(connector);
        Ok(runtime)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Started component handles.
    pub fn services(&self) -> Option<&Services> {
        self.services.as_ref()
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the control-plane listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            data_dir = %self.config.node.data_dir,
            address = %self.config.node.address,
            "starting kvsql runtime"
        );

        self.init_services().await?;
        self.start_listener().await?;
        self.start_maintenance()?;

        self.running.store(true, Ordering::Release);
        tracing::info!("kvsql runtime started");
        Ok(())
    }

    /// Storage, node store, identity, broadcaster and membership.
    async fn init_services(&mut self) -> Result<()> {
        let data_dir = self.config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

        let retry = RetryPolicy::new(self.config.storage.retry_attempts, self.config.retry_delay());
        let db = Db::open(self.config.database_path(), retry).context("failed to open database")?;
        self.health.storage = ComponentHealth::Healthy;
        tracing::info!(path = %self.config.database_path().display(), "storage opened");

        let node_store = Arc::new(NodeStore::open(&data_dir).context("failed to open node store")?);

        let init = InitFile::load(&data_dir).context("failed to read init file")?;
        let identity = match init {
            Some(ref init) => self.identity_from_init(init, &db, &node_store).await?,
            None => NodeIdentity::load(&data_dir).context(
                "no node identity found: run 'kvsql init' to bootstrap or join a cluster",
            )?,
        };

        let connector: Arc<dyn NodeConnector> = match self.connector {
            Some(ref connector) => connector.clone(),
            None => Arc::new(LocalCluster::bootstrap(identity.id, identity.address.clone())),
        };
        if node_store.is_empty() {
            node_store.set_addresses(std::slice::from_ref(&identity.address))?;
        }

        let transport = self.transport()?;
        let broadcaster = Arc::new(Broadcaster::new(DEFAULT_EVENT_CAPACITY));
        self.health.watch = ComponentHealth::Healthy;

        let membership = Arc::new(Membership::new(
            identity.address.clone(),
            node_store.clone(),
            connector,
            &self.config.membership,
        ));

        if let Some(init) = init {
            self.register(&init, &identity, &db, &membership).await?;
            identity.write(&data_dir)?;
            InitFile::remove(&data_dir)?;
        }
        self.health.membership = ComponentHealth::Healthy;

        let notifier = Arc::new(ClusterNotifier::new(
            broadcaster.clone(),
            membership.clone(),
            ApiClient::new(transport.clone()),
        ));
        let store = KvStore::new(db.clone(), notifier);

        tracing::info!(id = identity.id, address = %identity.address, "node identity ready");
        self.services = Some(Services {
            identity,
            db,
            node_store,
            broadcaster,
            membership,
            store,
            transport,
        });
        Ok(())
    }

    /// Decide this node's id from `init.toml`.
    ///
    /// A bootstrap node is always id 1. A joining node seeds the node store
    /// with the listed members and takes the next id after every id known
    /// to the servers table or to the current leader.
    async fn identity_from_init(
        &self,
        init: &InitFile,
        db: &Db,
        node_store: &Arc<NodeStore>,
    ) -> Result<NodeIdentity> {
        if init.is_bootstrap() {
            return Ok(NodeIdentity {
                id: 1,
                address: init.address.clone(),
            });
        }

        node_store
            .set_addresses(&init.cluster)
            .context("failed to initialize node store")?;

        let mut max_id = db.max_server_id().await?;
        if let Some(ref connector) = self.connector {
            let probe = Membership::new(
                init.address.clone(),
                node_store.clone(),
                connector.clone(),
                &self.config.membership,
            );
            let members = tokio::time::timeout(self.config.membership.join_timeout(), probe.list())
                .await
                .context("timed out listing cluster members")?
                .context("failed to list cluster members")?;
            max_id = members.iter().map(|m| m.id).fold(max_id, u64::max);
        }

        Ok(NodeIdentity {
            id: max_id + 1,
            address: init.address.clone(),
        })
    }

    /// Record a freshly initialised node in the cluster.
    async fn register(
        &self,
        init: &InitFile,
        identity: &NodeIdentity,
        db: &Db,
        membership: &Membership,
    ) -> Result<()> {
        if !init.is_bootstrap() {
            tokio::time::timeout(
                self.config.membership.join_timeout(),
                membership.add(identity.id, &identity.address),
            )
            .await
            .context("timed out joining cluster")?
            .context("failed to join cluster")?;
        }
        db.add_server(identity.id, &identity.address).await?;
        tracing::info!(
            id = identity.id,
            address = %identity.address,
            bootstrap = init.is_bootstrap(),
            "node registered"
        );
        Ok(())
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        match TlsConfig::from_section(&self.config.tls) {
            Some(tls) => Ok(Arc::new(tls.dialer().context("failed to build TLS client")?)),
            None => Ok(Arc::new(PlainTransport)),
        }
    }

    /// Start the control-plane listener.
    async fn start_listener(&mut self) -> Result<()> {
        let services = self
            .services
            .as_ref()
            .context("runtime services not initialized")?;

        let acceptor = match TlsConfig::from_section(&self.config.tls) {
            Some(tls) => Some(tls.acceptor().context("failed to build TLS server")?),
            None => {
                tracing::warn!(address = %self.config.node.address, "serving control plane in INSECURE mode (no TLS)");
                None
            }
        };

        let listener = TcpListener::bind(&self.config.node.address)
            .await
            .with_context(|| format!("failed to bind {}", self.config.node.address))?;
        self.local_addr = Some(listener.local_addr()?);

        let router = api::router(ApiState {
            store: services.store.clone(),
            broadcaster: services.broadcaster.clone(),
            membership: services.membership.clone(),
            engine_socket: self.config.engine_socket(),
            shutdown: self.watch_cancel.clone(),
        });
        let shutdown_rx = self.shutdown_rx.clone();
        self.listener_handle = Some(tokio::spawn(listener::serve(
            listener, acceptor, router, shutdown_rx,
        )));
        self.health.listener = ComponentHealth::Healthy;
        Ok(())
    }

    fn start_maintenance(&mut self) -> Result<()> {
        let services = self
            .services
            .clone()
            .context("runtime services not initialized")?;
        let config = self.config.maintenance.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        self.maintenance_handle = Some(tokio::spawn(maintenance_loop(services, config, shutdown_rx)));
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or [`Runtime::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping kvsql runtime");

        // Handover first, while the listener can still serve peers.
        if let Some(ref services) = self.services {
            self.health.membership = ComponentHealth::Stopping;
            services.membership.shutdown().await;
            self.health.membership = ComponentHealth::Stopped;
        }

        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        self.watch_cancel.cancel();

        if let Some(handle) = self.listener_handle.take() {
            self.health.listener = ComponentHealth::Stopping;
            match tokio::time::timeout(LISTENER_STOP_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => tracing::debug!("listener stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "listener stopped with error"),
                Ok(Err(e)) => tracing::warn!(error = %e, "listener task panicked"),
                Err(_) => tracing::warn!("listener stop timed out"),
            }
        }
        self.health.listener = ComponentHealth::Stopped;

        if let Some(handle) = self.maintenance_handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "maintenance task panicked");
            }
        }

        if let Some(services) = self.services.take() {
            self.health.watch = ComponentHealth::Stopping;
            services.broadcaster.shutdown();
            self.health.watch = ComponentHealth::Stopped;
        }
        self.health.storage = ComponentHealth::Stopped;

        tracing::info!("kvsql runtime stopped");
        Ok(())
    }

    /// Start the runtime for tests (without listener or maintenance loop).
    pub async fn start_for_tests(&mut self) -> Result<()> {
        self.init_services().await?;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Run one pass of every maintenance task.
    pub async fn run_maintenance_once(&self) -> Result<()> {
        let services = self
            .services
            .as_ref()
            .context("runtime services not initialized")?;
        compact(services).await;
        refresh(services).await;
        adjust(services).await;
        Ok(())
    }

    /// Path of the data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir()
    }
}

/// Periodic compaction, node-store refresh and membership adjustment.
async fn maintenance_loop(
    services: Services,
    config: MaintenanceConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut compaction = ticker(config.compaction_interval_secs);
    let mut refresh_store = ticker(config.node_store_refresh_secs);
    let mut adjust_members = ticker(config.adjust_interval_secs);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = compaction.tick() => compact(&services).await,
            _ = refresh_store.tick() => refresh(&services).await,
            _ = adjust_members.tick() => adjust(&services).await,
        }
    }
    tracing::debug!("maintenance loop stopped");
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn compact(services: &Services) {
    match services.store.compact().await {
        Ok(stats) if stats.total() > 0 => {
            tracing::debug!(
                expired = stats.expired,
                compacted = stats.compacted,
                names = stats.names,
                "compaction pass"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "compaction failed"),
    }
}

async fn refresh(services: &Services) {
    if let Err(e) = services.membership.refresh_store(&services.db).await {
        tracing::warn!(error = %e, "node store refresh failed");
    }
}

async fn adjust(services: &Services) {
    match services.membership.adjust().await {
        Ok(outcome) => tracing::trace!(?outcome, "membership adjusted"),
        Err(e) => tracing::warn!(error = %e, "membership adjust failed"),
    }
}
