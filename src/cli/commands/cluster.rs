//! Cluster command implementation.

use crate::api::ApiClient;
use crate::cluster::NodeInfo;
use crate::core::config::Config;
use crate::net::tls::TlsConfig;
use crate::net::{PlainTransport, Transport};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::sync::Arc;

/// Cluster operations.
#[derive(Args, Debug)]
pub struct ClusterArgs {
    #[command(subcommand)]
    pub command: ClusterCommand,
}

/// Cluster subcommands.
#[derive(Subcommand, Debug)]
pub enum ClusterCommand {
    /// List cluster members.
    List {
        /// Node to ask (host:port). Defaults to node.address.
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Remove a member from the cluster.
    Remove {
        /// Address of the member to remove.
        #[arg(required = true)]
        address: String,
        /// Node to ask (host:port). Defaults to node.address.
        #[arg(short, long)]
        endpoint: Option<String>,
    },
}

/// Run the cluster command against a node's API.
pub async fn run_cluster(args: ClusterArgs, config: &Config) -> Result<()> {
    let transport: Arc<dyn Transport> = match TlsConfig::from_section(&config.tls) {
        Some(tls) => Arc::new(tls.dialer().context("failed to build TLS client")?),
        None => Arc::new(PlainTransport),
    };
    let client = ApiClient::new(transport);

    match args.command {
        ClusterCommand::List { endpoint } => {
            let endpoint = endpoint.unwrap_or_else(|| config.node.address.clone());
            let nodes = client
                .cluster(&endpoint)
                .await
                .with_context(|| format!("failed to list members via {}", endpoint))?;
            print!("{}", format_members(&nodes));
            Ok(())
        }
        ClusterCommand::Remove { address, endpoint } => {
            let endpoint = endpoint.unwrap_or_else(|| config.node.address.clone());
            client
                .remove(&endpoint, &address)
                .await
                .with_context(|| format!("failed to remove {} via {}", address, endpoint))?;
            println!("Removed {}", address);
            Ok(())
        }
    }
}

fn format_members(nodes: &[NodeInfo]) -> String {
    let width = nodes
        .iter()
        .map(|n| n.address.len())
        .max()
        .unwrap_or(0)
        .max("ADDRESS".len());

    let mut out = format!("{:<4} {:<width$} ROLE\n", "ID", "ADDRESS", width = width);
    for node in nodes {
        out.push_str(&format!(
            "{:<4} {:<width$} {}\n",
            node.id,
            node.address,
            node.role,
            width = width
        ));
    }
    out
}
