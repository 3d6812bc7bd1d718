//! Init command implementation.

use crate::cluster::{InitFile, NodeIdentity};
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Prepare the data directory to bootstrap or join a cluster.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Address this node will listen on and advertise (host:port).
    #[arg(long, required = true)]
    pub address: String,

    /// Address of an existing member to join. Repeatable; omit to bootstrap.
    #[arg(long = "join")]
    pub join: Vec<String>,
}

/// Write `init.toml` into `data_dir`. Consumed on the next `kvsql start`.
pub fn run_init(args: InitArgs, data_dir: &Path) -> Result<()> {
    if NodeIdentity::exists(data_dir) {
        anyhow::bail!(
            "node already initialized: {} exists",
            NodeIdentity::path(data_dir).display()
        );
    }
    if !args.address.contains(':') {
        anyhow::bail!("address must be host:port, got: {}", args.address);
    }

    let init = InitFile {
        address: args.address,
        cluster: args.join,
    };
    init.write(data_dir)
        .with_context(|| format!("failed to write {}", InitFile::path(data_dir).display()))?;

    if init.is_bootstrap() {
        println!("Node at {} will bootstrap a new cluster on start", init.address);
    } else {
        println!(
            "Node at {} will join {} on start",
            init.address,
            init.cluster.join(", ")
        );
    }
    Ok(())
}
