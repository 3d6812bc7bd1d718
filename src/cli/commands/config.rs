//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file.
    Validate,
    /// Print the effective configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command. `load` yields the effective configuration.
pub fn run_config(args: ConfigArgs, load: impl FnOnce() -> Result<Config>) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => {
            let config = load()?;
            println!("✓ Configuration is valid");
            if config.tls.insecure {
                println!("  ⚠ Warning: tls.insecure is set (development only)");
            }
            Ok(())
        }
        ConfigCommand::Show { format } => {
            let config = load()?;
            println!("{}", render(&config, &format)?);
            Ok(())
        }
    }
}

fn render(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        "toml" => Ok(toml::to_string_pretty(config)?),
        other => anyhow::bail!("unknown format: {} (expected toml or json)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "[node]\naddress = \"127.0.0.1:9000\"\n[tls]\ninsecure = true\n";

    #[test]
    fn test_render_includes_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let toml = render(&config, "toml").unwrap();
        assert!(toml.contains("retry_attempts = 10"));

        let json = render(&config, "json").unwrap();
        assert!(json.contains("\"address\": \"127.0.0.1:9000\""));

        assert!(render(&config, "yaml").is_err());
    }

    #[test]
    fn test_validate_propagates_load_errors() {
        let args = ConfigArgs {
            command: ConfigCommand::Validate,
        };
        assert!(run_config(args, || anyhow::bail!("missing")).is_err());
    }
}
