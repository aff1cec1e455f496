use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Anthropic Messages proxy for a fleet of OpenAI-compatible inference
/// workers.
#[derive(Debug, Parser)]
#[command(name = "hive", version)]
pub struct Args {
    /// Path to the hive.toml configuration file.
    #[arg(short, long, env = "HIVE_CONFIG", default_value = "hive.toml")]
    pub config: PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(short, long, env = "HIVE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. `info` or `server=debug,cluster=debug`.
    #[arg(long, env = "HIVE_LOG", default_value = "info")]
    pub log_filter: String,
}
