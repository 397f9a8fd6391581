use clap::{Parser, Subcommand};

/// chatcore-gateway — the session and stream core of a multi-provider chat assistant.
#[derive(Debug, Parser)]
#[command(name = "chatcore-gateway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Print version information.
    Version,
}

/// Load the configuration from the path specified by `CHATCORE_CONFIG` (or
/// `config.toml` by default).
pub fn load_config() -> anyhow::Result<(cc_domain::config::Config, String)> {
    let config_path = std::env::var("CHATCORE_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = cc_domain::config::Config::load(std::path::Path::new(&config_path))
        .map_err(|e| anyhow::anyhow!("loading {config_path}: {e}"))?;
    Ok((config, config_path))
}
