//! Translation pipeline and backend client configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use secrecy::SecretString;
use serde::Deserialize;

/// Configuration for the translation pipeline and the per-node backend clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Deadline for a single backend completion call.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,

    /// Watchdog deadline after which a silent upstream stream is force-terminated.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stream_watchdog: Duration,

    /// API key sent as a bearer token to every worker node. Workers in a
    /// trusted fleet often run without authentication, so this is optional.
    pub api_key: Option<SecretString>,

    /// Path probed for node liveness. `/v1/models` by default; some runtimes
    /// only expose `/health`.
    pub probe_path: String,

    /// Path queried for a node's current KV-cache state.
    pub cache_status_path: String,

    /// Retry policy for backend completion calls.
    pub retry: RetryConfig,

    /// Tool-call parser limits.
    pub parsers: ParserConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            stream_watchdog: Duration::from_secs(60),
            api_key: None,
            probe_path: "/v1/models".to_string(),
            cache_status_path: "/v1/cluster/cache".to_string(),
            retry: RetryConfig::default(),
            parsers: ParserConfig::default(),
        }
    }
}

/// Retry policy for backend completion calls. Retries are dispatched to a
/// different eligible node when one exists.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay, doubled per attempt with jitter.
    #[serde(deserialize_with = "deserialize_duration")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Resource limits enforced by every tool-call parser.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserConfig {
    /// Inputs larger than this are rejected before any parser runs.
    pub max_input_bytes: usize,
    /// Soft wall-clock budget per parse attempt.
    #[serde(deserialize_with = "deserialize_duration")]
    pub soft_budget: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_input_bytes: 1024 * 1024,
            soft_budget: Duration::from_millis(100),
        }
    }
}
