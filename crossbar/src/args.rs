use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Anthropic-protocol reverse proxy for local and cloud model backends.
#[derive(Debug, Parser)]
#[command(name = "crossbar", version, about)]
pub struct Args {
    /// Path to the crossbar.toml configuration file. Without one, the
    /// configuration comes from CROSSBAR_* environment variables and
    /// built-in defaults.
    #[arg(short, long, env = "CROSSBAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, overriding the configured debug level.
    /// Example: "proxy=debug,cluster=info".
    #[arg(long)]
    pub log_filter: Option<String>,
}
