//! The cluster manager: one instance per process, owning discovery, health
//! tracking, cache coordination, routing and the per-node backend
//! providers.
//!
//! Initialization and shutdown follow a fixed order (discovery first in,
//! first out); a failed initialization tears down the steps that already
//! ran. The lifecycle flag is a mutex-guarded monotone state so concurrent
//! initializations are rejected rather than raced.

use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use llm::provider::NodeProvider;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    ClusterError,
    cache::CacheCoordinator,
    discovery::{DiscoveredNode, Discovery, DiscoveryEvent},
    health::{HealthTracker, Outcome, StateChange},
    node::{ClusterStatus, NodeState},
    router::{Candidate, Router, RoutingContext, RoutingDecision},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
}

struct NodeHandle {
    url: RwLock<Url>,
    in_flight: AtomicU32,
    context_window: AtomicU32,
}

/// Decrements the node's in-flight counter when the request ends, however
/// it ends.
pub struct RequestGuard {
    handle: Arc<NodeHandle>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.handle.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A routed node, ready to serve one request.
pub struct SelectedNode {
    /// The chosen node.
    pub node_id: String,
    /// The node's backend client.
    pub provider: NodeProvider,
    /// Why and how confidently it was chosen.
    pub decision: RoutingDecision,
    /// In-flight accounting; hold for the duration of the request.
    pub guard: RequestGuard,
}

/// Snapshot of the whole cluster for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatusReport {
    /// Derived cluster status.
    pub status: ClusterStatus,
    /// All known nodes.
    pub nodes: Vec<NodeStatusReport>,
    /// Live sticky sessions.
    pub sticky_sessions: usize,
}

/// One node's row in the status report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusReport {
    /// Node identifier.
    pub id: String,
    /// Node base URL.
    pub url: String,
    /// Health state.
    pub state: NodeState,
    /// Windowed success rate.
    pub success_rate: f64,
    /// Mean probe latency in milliseconds.
    pub average_latency_ms: Option<u64>,
    /// Requests currently in flight.
    pub in_flight: u32,
    /// Prefix hash the node caches, when known.
    pub cached_prefix: Option<String>,
    /// Context window reported by the node.
    pub context_window: Option<u32>,
}

/// Singleton orchestrator of the worker fleet.
pub struct ClusterManager {
    config: config::Config,
    lifecycle: Mutex<Lifecycle>,
    providers: Arc<DashMap<String, NodeProvider>>,
    nodes: DashMap<String, Arc<NodeHandle>>,
    discovery: Arc<Discovery>,
    health: Arc<HealthTracker>,
    health_events: Mutex<Option<UnboundedReceiver<StateChange>>>,
    cache: Arc<CacheCoordinator>,
    router: Arc<Router>,
    cancel: CancellationToken,
    event_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClusterManager {
    /// Build the manager and its subsystems. Nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(config: config::Config) -> Arc<Self> {
        let providers: Arc<DashMap<String, NodeProvider>> = Arc::new(DashMap::new());

        let discovery = Arc::new(Discovery::new(config.cluster.discovery.clone(), config.llm.clone()));
        let (health, health_events) = HealthTracker::new(config.cluster.health.clone());
        let cache = CacheCoordinator::new(config.cluster.cache.clone(), Arc::clone(&providers));
        let router = Router::new(config.cluster.routing.clone());

        Arc::new(Self {
            config,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            providers,
            nodes: DashMap::new(),
            discovery,
            health,
            health_events: Mutex::new(Some(health_events)),
            cache,
            router,
            cancel: CancellationToken::new(),
            event_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Bring the cluster up: validate configuration, discover nodes, start
    /// health checks, warm caches, start routing. A failure tears down the
    /// steps that already ran and leaves the manager uninitialized.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ClusterError> {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if *lifecycle != Lifecycle::Uninitialized {
                return Err(ClusterError::AlreadyInitialized);
            }
            *lifecycle = Lifecycle::Initializing;
        }

        match self.initialize_inner().await {
            Ok(()) => {
                *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Ready;
                log::info!("Cluster manager initialized with {} node(s)", self.nodes.len());
                Ok(())
            }
            Err(error) => {
                log::error!("Cluster initialization failed: {error}");
                self.teardown().await;
                *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Uninitialized;
                Err(error)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.config
            .validate()
            .map_err(|error| ClusterError::Config(error.to_string()))?;

        let (initial, discovery_events) = self.discovery.start().await?;
        for node in initial {
            self.add_node(node);
        }

        self.health.start();

        // Warm-up failures are reported per node and never block start-up.
        let node_ids: Vec<String> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        self.cache.warm_up(node_ids).await;
        self.cache.start();

        self.router.start();

        let health_events = self
            .health_events
            .lock()
            .expect("health events lock poisoned")
            .take();

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.event_loop(discovery_events, health_events).await;
        });
        *self.event_task.lock().await = Some(handle);

        Ok(())
    }

    /// Shut the cluster down in reverse initialization order. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
            if *lifecycle != Lifecycle::Ready {
                return;
            }
            *lifecycle = Lifecycle::ShuttingDown;
        }

        self.teardown().await;

        *self.lifecycle.lock().expect("lifecycle lock poisoned") = Lifecycle::Uninitialized;
        log::info!("Cluster manager shut down");
    }

    async fn teardown(&self) {
        self.discovery.stop().await;
        self.health.stop().await;
        self.cache.stop().await;
        self.router.stop().await;

        self.cancel.cancel();
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.providers.clear();
        self.nodes.clear();
    }

    async fn event_loop(
        &self,
        mut discovery_events: UnboundedReceiver<DiscoveryEvent>,
        health_events: Option<UnboundedReceiver<StateChange>>,
    ) {
        let mut health_events = health_events;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                event = discovery_events.recv() => {
                    let Some(event) = event else { return };
                    self.on_discovery_event(event).await;
                }
                change = recv_or_pending(&mut health_events) => {
                    // Transition logging happens in the tracker; the manager
                    // reacts to nodes leaving the eligible set.
                    if !change.to.is_eligible() {
                        log::warn!(
                            "Node {} left the eligible set: {} -> {}",
                            change.node_id, change.from, change.to
                        );
                    }
                }
            }
        }
    }

    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(node) => {
                log::info!("Node {} joined at {}", node.id, node.url);
                let node_id = node.id.clone();
                self.add_node(node);
                self.cache.warm_up(vec![node_id]).await;
            }
            DiscoveryEvent::Updated(node) => {
                log::info!("Node {} moved to {}", node.id, node.url);
                self.providers.insert(
                    node.id.clone(),
                    NodeProvider::new(node.id.clone(), &node.url, &self.config.llm),
                );
                if let Some(handle) = self.nodes.get(&node.id) {
                    *handle.url.write().expect("node url lock poisoned") = node.url;
                }
            }
            DiscoveryEvent::Removed(node_id) => {
                log::info!("Node {node_id} left the cluster");
                self.remove_node(&node_id);
            }
        }
    }

    fn add_node(&self, node: DiscoveredNode) {
        let provider = NodeProvider::new(node.id.clone(), &node.url, &self.config.llm);

        self.providers.insert(node.id.clone(), provider.clone());
        self.health.track(node.id.clone(), provider);
        self.nodes.insert(
            node.id,
            Arc::new(NodeHandle {
                url: RwLock::new(node.url),
                in_flight: AtomicU32::new(0),
                context_window: AtomicU32::new(0),
            }),
        );
    }

    fn remove_node(&self, node_id: &str) {
        self.health.untrack(node_id);
        self.cache.remove_node(node_id);
        self.router.forget_node(node_id);
        self.providers.remove(node_id);
        // In-flight requests hold their own provider clone and guard; the
        // node's bookkeeping can go immediately.
        self.nodes.remove(node_id);
    }

    fn ensure_ready(&self) -> Result<(), ClusterError> {
        if *self.lifecycle.lock().expect("lifecycle lock poisoned") == Lifecycle::Ready {
            Ok(())
        } else {
            Err(ClusterError::NotInitialized)
        }
    }

    /// Route one request. `exclude` removes nodes that already failed this
    /// request from consideration. `None` means no eligible node remains;
    /// callers surface that as a 503-class error.
    pub fn select_node(
        &self,
        fingerprint: &llm::Fingerprint,
        session_id: Option<String>,
        exclude: &[String],
    ) -> Result<Option<SelectedNode>, ClusterError> {
        self.ensure_ready()?;

        let context = RoutingContext {
            system_prompt_hash: fingerprint.system_prompt_hash.clone(),
            tools_hash: fingerprint.tools_hash.clone(),
            estimated_tokens: fingerprint.cache_markers.estimated_tokens,
            session_id,
        };

        let candidates = self.candidates(exclude);
        let Some(decision) = self.router.select(&candidates, &context) else {
            return Ok(None);
        };

        let Some(provider) = self.providers.get(&decision.node_id).map(|p| p.value().clone()) else {
            return Ok(None);
        };
        let Some(handle) = self.nodes.get(&decision.node_id).map(|h| Arc::clone(h.value())) else {
            return Ok(None);
        };

        handle.in_flight.fetch_add(1, Ordering::Relaxed);

        Ok(Some(SelectedNode {
            node_id: decision.node_id.clone(),
            provider,
            decision,
            guard: RequestGuard { handle },
        }))
    }

    fn candidates(&self, exclude: &[String]) -> Vec<Candidate> {
        self.nodes
            .iter()
            .filter(|entry| !exclude.iter().any(|id| id == entry.key()))
            .filter_map(|entry| {
                let node_id = entry.key().clone();
                let snapshot = self.health.snapshot(&node_id)?;

                if !snapshot.state.is_eligible() {
                    return None;
                }

                let cache_entry = self.cache.entry_for(&node_id);

                Some(Candidate {
                    node_id,
                    in_flight: entry.value().in_flight.load(Ordering::Relaxed),
                    average_latency: snapshot.average_latency,
                    success_rate: snapshot.success_rate,
                    cache_prefix_hash: cache_entry.as_ref().map(|e| e.prefix_hash.clone()),
                    cache_age: cache_entry.as_ref().map(|e| e.last_updated.elapsed()),
                })
            })
            .collect()
    }

    /// The provider for a node, independent of routing.
    pub fn provider(&self, node_id: &str) -> Result<NodeProvider, ClusterError> {
        self.providers
            .get(node_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))
    }

    /// Funnel a request success into the node's health record.
    pub fn record_success(&self, node_id: &str, latency: Duration) {
        self.health.record_outcome(node_id, Outcome::Success { latency });
    }

    /// Funnel a request failure into the node's health record.
    pub fn record_failure(&self, node_id: &str, error: &llm::LlmError) {
        let outcome = match error {
            llm::LlmError::UpstreamTimeout(_) => Outcome::Timeout,
            llm::LlmError::ConnectionError(_) => Outcome::NetworkError,
            _ => Outcome::HttpError,
        };
        self.health.record_outcome(node_id, outcome);
    }

    /// Record the context window a probe reported for a node.
    pub fn record_context_window(&self, node_id: &str, context_window: u32) {
        if let Some(handle) = self.nodes.get(node_id) {
            handle.context_window.store(context_window, Ordering::Relaxed);
        }
    }

    /// Status snapshot across all subsystems.
    pub fn status(&self) -> ClusterStatusReport {
        let states: Vec<NodeState> = self.health.states().into_iter().map(|(_, state)| state).collect();

        let mut nodes: Vec<NodeStatusReport> = self
            .nodes
            .iter()
            .filter_map(|entry| {
                let node_id = entry.key().clone();
                let snapshot = self.health.snapshot(&node_id)?;
                let cache_entry = self.cache.entry_for(&node_id);
                let context_window = entry.value().context_window.load(Ordering::Relaxed);

                Some(NodeStatusReport {
                    url: entry.value().url.read().expect("node url lock poisoned").to_string(),
                    id: node_id,
                    state: snapshot.state,
                    success_rate: snapshot.success_rate,
                    average_latency_ms: snapshot.average_latency.map(|latency| latency.as_millis() as u64),
                    in_flight: entry.value().in_flight.load(Ordering::Relaxed),
                    cached_prefix: cache_entry.map(|e| e.prefix_hash),
                    context_window: (context_window > 0).then_some(context_window),
                })
            })
            .collect();

        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        ClusterStatusReport {
            status: ClusterStatus::derive(&states),
            nodes,
            sticky_sessions: self.router.session_count(),
        }
    }
}

/// Receive from an optional channel, pending forever when it is absent or
/// closed so the surrounding `select!` ignores this arm.
async fn recv_or_pending(events: &mut Option<UnboundedReceiver<StateChange>>) -> StateChange {
    match events {
        Some(receiver) => match receiver.recv().await {
            Some(change) => change,
            None => {
                *events = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}
