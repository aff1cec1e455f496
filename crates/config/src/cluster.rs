//! Worker fleet configuration: discovery, health tracking, cache
//! coordination and routing.

use std::{path::PathBuf, time::Duration};

use duration_str::deserialize_duration;
use serde::Deserialize;
use url::Url;

/// Worker fleet configuration settings.
#[derive(Default, Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Node discovery configuration.
    pub discovery: DiscoveryConfig,
    /// Per-node health tracking configuration.
    pub health: HealthTrackerConfig,
    /// KV-cache coordination configuration.
    pub cache: CacheConfig,
    /// Request routing configuration.
    pub routing: RoutingConfig,
}

/// How worker nodes are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// A literal list of nodes from `static_nodes`.
    Static,
    /// DNS SRV lookup of `_service._tcp.<domain>` records.
    DnsSrv,
    /// Query a container-orchestrator endpoint for labelled workers.
    ServiceLabel,
}

/// Node discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Selected discovery mode.
    pub mode: DiscoveryMode,
    /// Re-discovery period.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// Timeout for the liveness probe validating each discovered endpoint.
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_timeout: Duration,
    /// Nodes for `static` mode.
    pub static_nodes: Vec<StaticNode>,
    /// Parameters for `dns_srv` mode.
    pub dns_srv: Option<DnsSrvDiscoveryConfig>,
    /// Parameters for `service_label` mode.
    pub service_label: Option<ServiceLabelDiscoveryConfig>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Static,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            static_nodes: Vec::new(),
            dns_srv: None,
            service_label: None,
        }
    }
}

/// A statically configured worker node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticNode {
    /// Stable node identifier.
    pub id: String,
    /// Base URL of the node's OpenAI-compatible API.
    pub url: Url,
}

/// DNS SRV discovery parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSrvDiscoveryConfig {
    /// Full SRV name, e.g. `_mlx._tcp.workers.internal`.
    pub service: String,
    /// Scheme used for discovered host:port pairs.
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Service-label discovery parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceLabelDiscoveryConfig {
    /// Orchestrator endpoint listing worker endpoints as JSON.
    pub endpoint: Url,
    /// Label selecting the worker fleet.
    pub label: String,
}

/// Per-node health tracking configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthTrackerConfig {
    /// Period between health probes of each node.
    #[serde(deserialize_with = "deserialize_duration")]
    pub check_interval: Duration,
    /// Timeout for a single probe.
    #[serde(deserialize_with = "deserialize_duration")]
    pub probe_timeout: Duration,
    /// Length of the rolling outcome window.
    #[serde(deserialize_with = "deserialize_duration")]
    pub window: Duration,
    /// Healthy nodes fall to Degraded below this windowed success rate.
    pub degraded_success_rate: f64,
    /// Degraded nodes fall to Unhealthy below this windowed success rate.
    pub unhealthy_success_rate: f64,
    /// Consecutive failures that force a node to Unhealthy.
    pub max_consecutive_failures: u32,
    /// Consecutive successes required to return a failing node to Healthy.
    pub success_threshold: u32,
    /// Retry backoff for Unhealthy nodes.
    pub backoff: BackoffConfig,
}

impl Default for HealthTrackerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            window: Duration::from_secs(30),
            degraded_success_rate: 0.8,
            unhealthy_success_rate: 0.5,
            max_consecutive_failures: 3,
            success_threshold: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Upper bound on the delay.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

/// KV-cache coordination configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Period between cache-registry refreshes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sync_interval: Duration,
    /// Registry entries older than this are expired.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_cache_age: Duration,
    /// System prompt warmed into every node at cluster start, inline.
    pub system_prompt: Option<String>,
    /// System prompt loaded from a file; wins over `system_prompt`.
    pub system_prompt_file: Option<PathBuf>,
    /// Model name used for warm-up requests. Single-model runtimes accept
    /// any name, so `default` works unless the runtime validates it.
    pub warmup_model: Option<String>,
    /// Warm-up parameters.
    pub warmup: WarmupConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            max_cache_age: Duration::from_secs(300),
            system_prompt: None,
            system_prompt_file: None,
            warmup_model: None,
            warmup: WarmupConfig::default(),
        }
    }
}

/// Warm-up parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WarmupConfig {
    /// Nodes warmed in parallel.
    pub concurrency: usize,
    /// Timeout for one warm-up attempt against one node.
    #[serde(deserialize_with = "deserialize_duration")]
    pub per_node_timeout: Duration,
    /// Attempts per node before the node is reported as warm-up failed.
    pub retries: u32,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            per_node_timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

/// Node selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Rotate through eligible nodes.
    RoundRobin,
    /// Lowest in-flight count, latency tie-break.
    LeastLoaded,
    /// Score nodes by cache affinity, health and load.
    CacheAware,
    /// Lowest average probe latency.
    Latency,
}

/// Request routing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Selected strategy.
    pub strategy: RoutingStrategy,
    /// Sticky session lifetime, refreshed on every selection.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sticky_ttl: Duration,
    /// Upper bound on tracked sticky sessions.
    pub max_sessions: usize,
    /// Period of the proactive expired-session sweep.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::CacheAware,
            sticky_ttl: Duration::from_secs(300),
            max_sessions: 10_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}
