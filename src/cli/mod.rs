//! Command-line interface.

pub mod commands;

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "kvsql.toml";

/// kvsql - etcd-style MVCC key-value store over a replicated SQL log.
#[derive(Parser, Debug)]
#[command(name = "kvsql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub globals: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Data directory.
    #[arg(long, global = true)]
    pub data_dir: Option<String>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Start(commands::StartArgs),
    /// Prepare the data directory to bootstrap or join a cluster.
    Init(commands::InitArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Cluster operations.
    Cluster(commands::ClusterArgs),
}

impl GlobalArgs {
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(self.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH))
    }

    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level.clone(),
            data_dir: self.data_dir.clone(),
            address: None,
        }
    }

    /// Load the config file, apply global flags and re-validate.
    pub fn load_config(&self) -> Result<Config> {
        let path = self.config_path();
        let mut config = Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?;
        config.apply_overrides(&self.overrides());
        config
            .validate()
            .context("invalid configuration after overrides")?;
        Ok(config)
    }

    /// Data directory for commands that may run before a config exists:
    /// `--data-dir`, else the config file's, else `data`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.data_dir {
            return PathBuf::from(dir);
        }
        match self.load_config() {
            Ok(config) => config.data_dir(),
            Err(_) => PathBuf::from("data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kvsql",
            "cluster",
            "remove",
            "10.0.0.2:9000",
            "--endpoint",
            "10.0.0.1:9000",
            "--config",
            "/etc/kvsql.toml",
        ])
        .unwrap();
        assert_eq!(cli.globals.config_path(), PathBuf::from("/etc/kvsql.toml"));
        match cli.command {
            Commands::Cluster(args) => match args.command {
                commands::ClusterCommand::Remove { address, endpoint } => {
                    assert_eq!(address, "10.0.0.2:9000");
                    assert_eq!(endpoint.as_deref(), Some("10.0.0.1:9000"));
                }
                other => panic!("unexpected command: {:?}", other),
            },
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_init_join_is_repeatable() {
        let cli = Cli::try_parse_from([
            "kvsql",
            "init",
            "--address",
            "10.0.0.3:9000",
            "--join",
            "10.0.0.1:9000",
            "--join",
            "10.0.0.2:9000",
        ])
        .unwrap();
        match cli.command {
            Commands::Init(args) => assert_eq!(args.join.len(), 2),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_data_dir_flag_wins() {
        let globals = GlobalArgs {
            data_dir: Some("/var/lib/kvsql".to_string()),
            ..GlobalArgs::default()
        };
        assert_eq!(globals.data_dir(), PathBuf::from("/var/lib/kvsql"));
        assert_eq!(
            globals.overrides().data_dir.as_deref(),
            Some("/var/lib/kvsql")
        );
    }
}
