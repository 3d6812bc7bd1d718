//! CLI command implementations.

mod cluster;
mod config;
mod init;
mod start;

pub use cluster::{run_cluster, ClusterArgs, ClusterCommand};
pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use init::{run_init, InitArgs};
pub use start::{run_start, StartArgs};
