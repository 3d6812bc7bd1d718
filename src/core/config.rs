//! Configuration parsing and validation.
//!
//! kvsql configuration is loaded from a TOML file with CLI overrides layered
//! on top. Every section except `[node]` is optional and falls back to
//! defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level kvsql configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and local paths.
    pub node: NodeConfig,

    /// TLS material for the control-plane listener and dialer.
    #[serde(default)]
    pub tls: TlsSection,

    /// Durable storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Periodic background task intervals.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Membership administrative timeouts.
    #[serde(default)]
    pub membership: MembershipConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory holding the database, identity and node store files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Address of the control-plane API listener (host:port).
    pub address: String,

    /// Unix socket the replicated-log engine listens on. Defaults to
    /// `<data_dir>/engine.sock`.
    #[serde(default)]
    pub engine_socket: Option<String>,
}

/// TLS file paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSection {
    /// Node certificate chain (PEM).
    pub cert_path: Option<String>,
    /// Node private key (PEM).
    pub key_path: Option<String>,
    /// Cluster CA used for both server and client verification.
    pub ca_path: Option<String>,
    /// Serve and dial plaintext. Development only.
    #[serde(default)]
    pub insecure: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Attempts made for a "database locked" failure before giving up.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Delay between locked retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Maintenance loop intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// TTL sweep and history compaction period.
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Node store refresh period.
    #[serde(default = "default_node_store_refresh_secs")]
    pub node_store_refresh_secs: u64,

    /// Membership rebalancing period.
    #[serde(default = "default_adjust_interval_secs")]
    pub adjust_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            compaction_interval_secs: default_compaction_interval_secs(),
            node_store_refresh_secs: default_node_store_refresh_secs(),
            adjust_interval_secs: default_adjust_interval_secs(),
        }
    }
}

/// Membership timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Timeout for a single administrative call.
    #[serde(default = "default_admin_timeout_secs")]
    pub admin_timeout_secs: u64,

    /// Timeout for leader discovery across the node store.
    #[serde(default = "default_leader_timeout_secs")]
    pub leader_timeout_secs: u64,

    /// Timeout for first-contact join at bootstrap.
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Upper bound for the graceful handover at shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            admin_timeout_secs: default_admin_timeout_secs(),
            leader_timeout_secs: default_leader_timeout_secs(),
            join_timeout_secs: default_join_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl MembershipConfig {
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_secs(self.leader_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    250
}

fn default_compaction_interval_secs() -> u64 {
    60
}

fn default_node_store_refresh_secs() -> u64 {
    5
}

fn default_adjust_interval_secs() -> u64 {
    30
}

fn default_admin_timeout_secs() -> u64 {
    5
}

fn default_leader_timeout_secs() -> u64 {
    15
}

fn default_join_timeout_secs() -> u64 {
    30
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content).with_context(|| "failed to parse config file")
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.node.data_dir = data_dir.clone();
        }
        if let Some(ref address) = overrides.address {
            self.node.address = address.clone();
        }
    }

    /// Data directory as a path.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    /// Path of the local engine socket.
    pub fn engine_socket(&self) -> PathBuf {
        match self.node.engine_socket {
            Some(ref path) => PathBuf::from(path),
            None => self.data_dir().join("engine.sock"),
        }
    }

    /// Path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("kvsql.db")
    }

    /// Retry delay as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.storage.retry_delay_ms)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_tls()?;
        self.validate_storage()?;
        self.validate_maintenance()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.address.is_empty() {
            anyhow::bail!("node.address must be set");
        }
        if !self.node.address.contains(':') {
            anyhow::bail!("node.address must be host:port, got: {}", self.node.address);
        }
        if self.node.data_dir.is_empty() {
            anyhow::bail!("node.data_dir must not be empty");
        }
        Ok(())
    }

    fn validate_tls(&self) -> Result<()> {
        let tls = &self.tls;
        let set = [&tls.cert_path, &tls.key_path, &tls.ca_path]
            .iter()
            .filter(|p| p.is_some())
            .count();

        match set {
            0 if !tls.insecure => {
                anyhow::bail!("tls requires cert_path, key_path and ca_path, or insecure = true")
            }
            0 | 3 => {}
            _ => anyhow::bail!("tls.cert_path, tls.key_path and tls.ca_path must be set together"),
        }
        Ok(())
    }

    fn validate_storage(&self) -> Result<()> {
        if self.storage.retry_attempts == 0 {
            anyhow::bail!("storage.retry_attempts must be > 0");
        }
        Ok(())
    }

    fn validate_maintenance(&self) -> Result<()> {
        let m = &self.maintenance;
        if m.compaction_interval_secs == 0
            || m.node_store_refresh_secs == 0
            || m.adjust_interval_secs == 0
        {
            anyhow::bail!("maintenance intervals must be > 0");
        }
        if self.membership.admin_timeout_secs == 0 {
            anyhow::bail!("membership.admin_timeout_secs must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override data directory.
    pub data_dir: Option<String>,
    /// Override API address.
    pub address: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[node]
address = "127.0.0.1:9000"

[tls]
insecure = true
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.node.data_dir, "data");
        assert_eq!(config.storage.retry_attempts, 10);
        assert_eq!(config.storage.retry_delay_ms, 250);
        assert_eq!(config.maintenance.compaction_interval_secs, 60);
        assert_eq!(config.membership.admin_timeout(), Duration::from_secs(5));
        assert_eq!(config.membership.join_timeout(), Duration::from_secs(30));
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.engine_socket(), PathBuf::from("data/engine.sock"));
    }

    #[test]
    fn test_tls_all_or_nothing() {
        let partial = r#"
[node]
address = "127.0.0.1:9000"

[tls]
cert_path = "cluster.crt"
"#;
        assert!(Config::from_toml(partial).is_err());
    }

    #[test]
    fn test_tls_required_unless_insecure() {
        let plain = r#"
[node]
address = "127.0.0.1:9000"
"#;
        assert!(Config::from_toml(plain).is_err());
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let content = format!("{}\n[telemetry]\nlog_level = \"loud\"\n", MINIMAL);
        assert!(Config::from_toml(&content).is_err());
    }

    #[test]
    fn test_address_needs_port() {
        let content = "[node]\naddress = \"localhost\"\n[tls]\ninsecure = true\n";
        assert!(Config::from_toml(content).is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".to_string()),
            data_dir: Some("/var/lib/kvsql".to_string()),
            address: None,
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/kvsql/kvsql.db"));
        assert_eq!(config.node.address, "127.0.0.1:9000");
    }
}
