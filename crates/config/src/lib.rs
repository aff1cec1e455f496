//! Hive configuration structures to map the hive.toml configuration.

#![deny(missing_docs)]

mod cluster;
mod llm;
mod loader;
mod server;

use std::path::Path;

pub use cluster::{
    BackoffConfig, CacheConfig, ClusterConfig, DiscoveryConfig, DiscoveryMode, DnsSrvDiscoveryConfig,
    HealthTrackerConfig, RoutingConfig, RoutingStrategy, ServiceLabelDiscoveryConfig, StaticNode, WarmupConfig,
};
pub use llm::{LlmConfig, ParserConfig, RetryConfig};
use serde::Deserialize;
pub use server::{HealthEndpointConfig, ServerConfig};

/// Main configuration structure for the Hive proxy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Translation and backend client configuration settings.
    pub llm: LlmConfig,
    /// Worker fleet configuration settings.
    pub cluster: ClusterConfig,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
