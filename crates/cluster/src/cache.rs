//! KV-cache coordination: warm-up at cluster start, a registry of which
//! node holds which prompt prefix, and a periodic re-sync from the nodes.
//!
//! The registry keeps two indexes, by node and by prefix hash, that are
//! always updated together under one lock, so readers never observe half a
//! pair and `nodes_with_prefix` stays O(1).

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use futures::{StreamExt, stream};
use llm::provider::NodeProvider;
use tokio_util::sync::CancellationToken;

/// One node's registered cache state.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The node holding the prefix.
    pub node_id: String,
    /// Hash of the cached system prompt.
    pub prefix_hash: String,
    /// Cached prefix length in tokens.
    pub token_count: u32,
    /// When the entry was last confirmed.
    pub last_updated: Instant,
    /// Cache hit rate reported by the node, if any.
    pub hit_rate: Option<f64>,
}

#[derive(Default)]
struct Registry {
    by_node: HashMap<String, CacheEntry>,
    by_hash: HashMap<String, BTreeSet<String>>,
}

impl Registry {
    fn upsert(&mut self, entry: CacheEntry) {
        self.remove(&entry.node_id);
        self.by_hash
            .entry(entry.prefix_hash.clone())
            .or_default()
            .insert(entry.node_id.clone());
        self.by_node.insert(entry.node_id.clone(), entry);
    }

    fn remove(&mut self, node_id: &str) {
        let Some(previous) = self.by_node.remove(node_id) else {
            return;
        };

        if let Some(nodes) = self.by_hash.get_mut(&previous.prefix_hash) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                self.by_hash.remove(&previous.prefix_hash);
            }
        }
    }

    fn expire_older_than(&mut self, max_age: Duration) {
        let expired: Vec<String> = self
            .by_node
            .values()
            .filter(|entry| entry.last_updated.elapsed() > max_age)
            .map(|entry| entry.node_id.clone())
            .collect();

        for node_id in expired {
            log::debug!("Expiring stale cache entry for node {node_id}");
            self.remove(&node_id);
        }
    }
}

/// Result of warming one node.
#[derive(Debug, Clone)]
pub struct WarmupOutcome {
    /// The node that was warmed.
    pub node_id: String,
    /// `Ok` after a successful attempt, otherwise the last error text.
    pub result: Result<(), String>,
}

/// Cache coordinator for the fleet.
pub struct CacheCoordinator {
    config: config::CacheConfig,
    providers: Arc<DashMap<String, NodeProvider>>,
    registry: Mutex<Registry>,
    sync_in_flight: AtomicBool,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Build the coordinator over the fleet's shared provider set.
    pub fn new(config: config::CacheConfig, providers: Arc<DashMap<String, NodeProvider>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            providers,
            registry: Mutex::new(Registry::default()),
            sync_in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// The configured warm-up prompt, if any. A prompt file wins over the
    /// inline form.
    pub fn system_prompt(&self) -> Option<String> {
        if let Some(file) = &self.config.system_prompt_file {
            match std::fs::read_to_string(file) {
                Ok(prompt) => return Some(prompt),
                Err(error) => {
                    log::error!("Failed to read system prompt file {}: {error}", file.display());
                }
            }
        }

        self.config.system_prompt.clone()
    }

    /// Warm every listed node with the fleet's system prompt, bounded by the
    /// configured concurrency. Per-node failures are reported in the outcome
    /// list; they never abort the rest of the fleet.
    pub async fn warm_up(&self, node_ids: Vec<String>) -> Vec<WarmupOutcome> {
        let Some(prompt) = self.system_prompt() else {
            log::debug!("No warm-up system prompt configured; skipping warm-up");
            return Vec::new();
        };

        let prompt = Arc::new(prompt);
        let prefix_hash = llm::system_prompt_hash(&prompt);
        let model = self.config.warmup_model.clone().unwrap_or_else(|| "default".to_string());
        let warmup = &self.config.warmup;

        let outcomes: Vec<WarmupOutcome> = stream::iter(node_ids)
            .map(|node_id| {
                let prompt = Arc::clone(&prompt);
                let model = model.clone();
                let provider = self.providers.get(&node_id).map(|entry| entry.value().clone());

                async move {
                    let Some(provider) = provider else {
                        return WarmupOutcome {
                            node_id,
                            result: Err("no provider for node".to_string()),
                        };
                    };

                    let mut last_error = "no attempts made".to_string();

                    for attempt in 0..warmup.retries.max(1) {
                        match provider.warm_up(&model, &prompt, warmup.per_node_timeout).await {
                            Ok(()) => {
                                return WarmupOutcome {
                                    node_id,
                                    result: Ok(()),
                                };
                            }
                            Err(error) => {
                                log::debug!("Warm-up attempt {} for {node_id} failed: {error}", attempt + 1);
                                last_error = error.to_string();
                            }
                        }
                    }

                    WarmupOutcome {
                        node_id,
                        result: Err(last_error),
                    }
                }
            })
            .buffer_unordered(warmup.concurrency)
            .collect()
            .await;

        let now = Instant::now();
        let estimated_tokens = (prompt.chars().count() as u32).div_ceil(4);

        {
            let mut registry = self.registry.lock().expect("cache registry lock poisoned");
            for outcome in &outcomes {
                if outcome.result.is_ok() {
                    registry.upsert(CacheEntry {
                        node_id: outcome.node_id.clone(),
                        prefix_hash: prefix_hash.clone(),
                        token_count: estimated_tokens,
                        last_updated: now,
                        hit_rate: None,
                    });
                }
            }
        }

        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => log::info!("Warmed up node {}", outcome.node_id),
                Err(error) => log::warn!("Warm-up failed for node {}: {error}", outcome.node_id),
            }
        }

        outcomes
    }

    /// Spawn the periodic sync loop. The next sync is scheduled from the
    /// completion of the previous one, so rounds never overlap.
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = coordinator.cancel.cancelled() => return,
                    () = tokio::time::sleep(coordinator.config.sync_interval) => {}
                }

                coordinator.sync_once().await;
            }
        });

        if let Ok(mut task) = self.task.try_lock() {
            *task = Some(handle);
        }
    }

    /// Cancel the sync loop and join it.
    pub async fn stop(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(error) = handle.await
        {
            log::warn!("Cache sync task ended abnormally: {error}");
        }
    }

    /// Query every node for its cache status and refresh the registry.
    /// Concurrent invocations are suppressed: one sync at a time.
    pub async fn sync_once(&self) {
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Cache sync already in flight; skipping");
            return;
        }

        let providers: Vec<(String, NodeProvider)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let statuses: Vec<(String, Option<llm::provider::CacheStatus>)> = stream::iter(providers)
            .map(|(node_id, provider)| async move {
                match provider.cache_status(Duration::from_secs(5)).await {
                    Ok(status) => (node_id, status),
                    Err(error) => {
                        log::debug!("Cache status query for {node_id} failed: {error}");
                        (node_id, None)
                    }
                }
            })
            .buffer_unordered(self.config.warmup.concurrency)
            .collect()
            .await;

        let now = Instant::now();

        {
            let mut registry = self.registry.lock().expect("cache registry lock poisoned");

            for (node_id, status) in statuses {
                // Nodes without a cache endpoint keep whatever entry they
                // had; staleness expiry below handles the rest.
                if let Some(status) = status {
                    registry.upsert(CacheEntry {
                        node_id,
                        prefix_hash: status.system_prompt_hash,
                        token_count: status.tokens,
                        last_updated: now,
                        hit_rate: status.hit_rate,
                    });
                }
            }

            registry.expire_older_than(self.config.max_cache_age);
        }

        self.sync_in_flight.store(false, Ordering::Release);
    }

    /// The registered cache entry for a node.
    pub fn entry_for(&self, node_id: &str) -> Option<CacheEntry> {
        self.registry
            .lock()
            .expect("cache registry lock poisoned")
            .by_node
            .get(node_id)
            .cloned()
    }

    /// Nodes currently holding the given prefix.
    pub fn nodes_with_prefix(&self, prefix_hash: &str) -> BTreeSet<String> {
        self.registry
            .lock()
            .expect("cache registry lock poisoned")
            .by_hash
            .get(prefix_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a departed node's entry from both indexes.
    pub fn remove_node(&self, node_id: &str) {
        self.registry
            .lock()
            .expect("cache registry lock poisoned")
            .remove(node_id);
    }

    /// Record a cache entry directly. Exposed for the manager to seed state
    /// observed outside the sync loop.
    pub fn record_entry(&self, entry: CacheEntry) {
        self.registry.lock().expect("cache registry lock poisoned").upsert(entry);
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let registry = self.registry.lock().expect("cache registry lock poisoned");

        for (node_id, entry) in &registry.by_node {
            assert!(
                registry
                    .by_hash
                    .get(&entry.prefix_hash)
                    .is_some_and(|nodes| nodes.contains(node_id)),
                "by_hash missing {node_id}"
            );
        }

        for (hash, nodes) in &registry.by_hash {
            assert!(!nodes.is_empty(), "empty set left for hash {hash}");
            for node_id in nodes {
                assert!(
                    registry.by_node.get(node_id).is_some_and(|entry| &entry.prefix_hash == hash),
                    "by_node disagrees for {node_id}"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::{get, post}};
    use serde_json::json;
    use tokio::net::TcpListener;
    use url::Url;

    fn coordinator(config: config::CacheConfig) -> (Arc<CacheCoordinator>, Arc<DashMap<String, NodeProvider>>) {
        let providers = Arc::new(DashMap::new());
        (CacheCoordinator::new(config, Arc::clone(&providers)), providers)
    }

    fn entry(node_id: &str, hash: &str) -> CacheEntry {
        CacheEntry {
            node_id: node_id.to_string(),
            prefix_hash: hash.to_string(),
            token_count: 100,
            last_updated: Instant::now(),
            hit_rate: None,
        }
    }

    #[tokio::test]
    async fn both_indexes_stay_consistent() {
        let (coordinator, _) = coordinator(config::CacheConfig::default());

        coordinator.record_entry(entry("w0", "hash-a"));
        coordinator.record_entry(entry("w1", "hash-a"));
        coordinator.record_entry(entry("w2", "hash-b"));
        coordinator.assert_indexes_consistent();

        assert_eq!(
            coordinator.nodes_with_prefix("hash-a"),
            BTreeSet::from(["w0".to_string(), "w1".to_string()])
        );

        // Re-registering a node under a new hash moves it atomically.
        coordinator.record_entry(entry("w0", "hash-b"));
        coordinator.assert_indexes_consistent();
        assert!(!coordinator.nodes_with_prefix("hash-a").contains("w0"));
        assert!(coordinator.nodes_with_prefix("hash-b").contains("w0"));

        // Removing the last node for a hash erases the hash key.
        coordinator.remove_node("w1");
        coordinator.assert_indexes_consistent();
        assert!(coordinator.nodes_with_prefix("hash-a").is_empty());
    }

    #[tokio::test]
    async fn stale_entries_expire() {
        let config = config::CacheConfig {
            max_cache_age: Duration::from_millis(10),
            ..Default::default()
        };
        let (coordinator, _) = coordinator(config);

        coordinator.record_entry(entry("w0", "hash-a"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        coordinator.sync_once().await;

        assert!(coordinator.entry_for("w0").is_none());
        coordinator.assert_indexes_consistent();
    }

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn sync_pulls_node_cache_state() {
        let app = Router::new().route(
            "/v1/cluster/cache",
            get(|| async { Json(json!({"systemPromptHash": "hash-x", "tokens": 2048, "hitRate": 0.5})) }),
        );
        let base = serve(app).await;

        let (coordinator, providers) = coordinator(config::CacheConfig::default());
        providers.insert(
            "w0".to_string(),
            NodeProvider::new("w0", &Url::parse(&base).unwrap(), &config::LlmConfig::default()),
        );

        coordinator.sync_once().await;

        let entry = coordinator.entry_for("w0").unwrap();
        assert_eq!(entry.prefix_hash, "hash-x");
        assert_eq!(entry.token_count, 2048);
        assert_eq!(entry.hit_rate, Some(0.5));
        assert_eq!(
            coordinator.nodes_with_prefix("hash-x"),
            BTreeSet::from(["w0".to_string()])
        );
    }

    #[tokio::test]
    async fn warm_up_registers_entries_and_reports_failures() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                Json(json!({
                    "id": "chatcmpl-1",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}]
                }))
            }),
        );
        let base = serve(app).await;

        let config = config::CacheConfig {
            system_prompt: Some("You are helpful.".to_string()),
            ..Default::default()
        };
        let (coordinator, providers) = coordinator(config);

        providers.insert(
            "alive".to_string(),
            NodeProvider::new("alive", &Url::parse(&base).unwrap(), &config::LlmConfig::default()),
        );
        providers.insert(
            "dead".to_string(),
            NodeProvider::new(
                "dead",
                &Url::parse("http://127.0.0.1:1").unwrap(),
                &config::LlmConfig::default(),
            ),
        );

        let outcomes = coordinator
            .warm_up(vec!["alive".to_string(), "dead".to_string()])
            .await;

        assert_eq!(outcomes.len(), 2);
        let alive = outcomes.iter().find(|o| o.node_id == "alive").unwrap();
        assert!(alive.result.is_ok());
        let dead = outcomes.iter().find(|o| o.node_id == "dead").unwrap();
        assert!(dead.result.is_err());

        let entry = coordinator.entry_for("alive").unwrap();
        assert_eq!(entry.prefix_hash, llm::system_prompt_hash("You are helpful."));
        assert!(coordinator.entry_for("dead").is_none());
        coordinator.assert_indexes_consistent();
    }
}
