//! kvsql - unified CLI entrypoint.
//!
//! Usage:
//!   kvsql init --address 10.0.0.1:9000
//!   kvsql init --address 10.0.0.2:9000 --join 10.0.0.1:9000
//!   kvsql start --config kvsql.toml
//!   kvsql config validate --config kvsql.toml
//!   kvsql cluster list [--endpoint host:port]
//!   kvsql cluster remove <address> [--endpoint host:port]

use anyhow::Result;
use clap::Parser;
use kvsql::cli::commands::{run_cluster, run_config, run_init, run_start};
use kvsql::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { globals, command } = Cli::parse();

    match command {
        Commands::Start(args) => run_start(args, globals.load_config()?).await,
        Commands::Init(args) => run_init(args, &globals.data_dir()),
        Commands::Config(args) => run_config(args, || globals.load_config()),
        Commands::Cluster(args) => run_cluster(args, &globals.load_config()?).await,
    }
}
