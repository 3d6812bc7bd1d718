//! Start command implementation.

use crate::core::config::Config;
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::Args;

/// Start the node.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the API listen/advertise address.
    #[arg(long)]
    pub address: Option<String>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over the configured level.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Run the start command with an already loaded config.
pub async fn run_start(args: StartArgs, mut config: Config) -> Result<()> {
    if let Some(address) = args.address {
        config.node.address = address;
        config.validate()?;
    }
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
