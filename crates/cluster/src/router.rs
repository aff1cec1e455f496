//! Request routing across eligible nodes.
//!
//! Four strategies share one entry point; cache-aware scoring is the
//! default. Sticky sessions sit in front of every strategy: a session bound
//! to a still-eligible node short-circuits scoring entirely.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Routing-relevant request identity, produced by the proxy from the
/// request fingerprint. Not persisted.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    /// Hash of the canonical system prompt.
    pub system_prompt_hash: String,
    /// Hash of the tools array.
    pub tools_hash: String,
    /// Rough token estimate for the cacheable prefix.
    pub estimated_tokens: u32,
    /// Caller-supplied affinity key.
    pub session_id: Option<String>,
}

/// A node the router may choose between, with the signals scoring needs.
/// Only eligible nodes should be offered.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Node identifier.
    pub node_id: String,
    /// Requests currently in flight on the node.
    pub in_flight: u32,
    /// Mean probe latency from the health snapshot.
    pub average_latency: Option<Duration>,
    /// Windowed success rate from the health snapshot.
    pub success_rate: f64,
    /// Prefix hash the node currently caches, if known.
    pub cache_prefix_hash: Option<String>,
    /// Age of the cache entry.
    pub cache_age: Option<Duration>,
}

/// The outcome of a selection.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// The chosen node.
    pub node_id: String,
    /// Which path chose it.
    pub reason: RoutingReason,
    /// Score confidence in `[0, 1]`; 1.0 for non-scoring strategies.
    pub confidence: f64,
}

/// Why a node was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingReason {
    /// An existing sticky session was honored.
    StickySession,
    /// Round-robin rotation.
    RoundRobin,
    /// Lowest in-flight count.
    LeastLoaded,
    /// Cache-affinity scoring.
    CacheAware,
    /// Lowest average latency.
    Latency,
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingReason::StickySession => "sticky-session",
            RoutingReason::RoundRobin => "round-robin",
            RoutingReason::LeastLoaded => "least-loaded",
            RoutingReason::CacheAware => "cache-aware",
            RoutingReason::Latency => "latency",
        };
        f.write_str(name)
    }
}

/// Scoring weights of the cache-aware strategy.
const PREFIX_MATCH_SCORE: f64 = 50.0;
const TOOLS_MATCH_SCORE: f64 = 20.0;
const SUCCESS_RATE_SCORE: f64 = 25.0;
const LOW_LOAD_SCORE: f64 = 15.0;
const FRESHNESS_SCORE: f64 = 10.0;
const MAX_SCORE: f64 = PREFIX_MATCH_SCORE + TOOLS_MATCH_SCORE + SUCCESS_RATE_SCORE + LOW_LOAD_SCORE + FRESHNESS_SCORE;

const LOW_LOAD_THRESHOLD: u32 = 5;
const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

struct StickySession {
    node_id: String,
    expires_at: Instant,
}

/// Node selector with sticky sessions.
pub struct Router {
    config: config::RoutingConfig,
    round_robin: AtomicUsize,
    sessions: DashMap<String, StickySession>,
    /// Last tools hash served per node, for the tools-affinity signal.
    last_tools: DashMap<String, String>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Router {
    /// Build a router for the configured strategy.
    pub fn new(config: config::RoutingConfig) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            round_robin: AtomicUsize::new(0),
            sessions: DashMap::new(),
            last_tools: DashMap::new(),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        })
    }

    /// Spawn the periodic sweep that evicts expired sticky sessions.
    pub fn start(self: &std::sync::Arc<Self>) {
        let router = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = router.cancel.cancelled() => return,
                    () = tokio::time::sleep(router.config.sweep_interval) => {}
                }

                router.sweep_expired();
            }
        });

        if let Ok(mut task) = self.task.try_lock() {
            *task = Some(handle);
        }
    }

    /// Cancel the sweep task and join it.
    pub async fn stop(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(error) = handle.await
        {
            log::warn!("Sticky session sweep task ended abnormally: {error}");
        }
    }

    /// Pick a node from the candidates. `None` when the slice is empty;
    /// callers surface that as a 503-class error.
    pub fn select(&self, candidates: &[Candidate], context: &RoutingContext) -> Option<RoutingDecision> {
        if candidates.is_empty() {
            log::warn!("Routing failed: no eligible node");
            return None;
        }

        let mut candidates: Vec<&Candidate> = candidates.iter().collect();
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        if let Some(session_id) = &context.session_id
            && let Some(node_id) = self.sticky_lookup(session_id, &candidates)
        {
            self.bind_session(session_id, &node_id);
            return Some(RoutingDecision {
                node_id,
                reason: RoutingReason::StickySession,
                confidence: 1.0,
            });
        }

        let decision = match self.config.strategy {
            config::RoutingStrategy::RoundRobin => self.round_robin(&candidates),
            config::RoutingStrategy::LeastLoaded => Self::least_loaded(&candidates),
            config::RoutingStrategy::CacheAware => self.cache_aware(&candidates, context),
            config::RoutingStrategy::Latency => Self::lowest_latency(&candidates),
        };

        if let Some(session_id) = &context.session_id {
            self.bind_session(session_id, &decision.node_id);
        }
        self.last_tools.insert(decision.node_id.clone(), context.tools_hash.clone());

        log::debug!(
            "Routed to {} ({}, confidence {:.2})",
            decision.node_id,
            decision.reason,
            decision.confidence
        );

        Some(decision)
    }

    /// Look up a live sticky binding whose node is still offered. Expired or
    /// invalidated bindings are removed on the spot.
    fn sticky_lookup(&self, session_id: &str, candidates: &[&Candidate]) -> Option<String> {
        let session = self.sessions.get(session_id)?;

        if Instant::now() >= session.expires_at {
            drop(session);
            self.sessions.remove(session_id);
            return None;
        }

        if !candidates.iter().any(|candidate| candidate.node_id == session.node_id) {
            let node_id = session.node_id.clone();
            drop(session);
            self.sessions.remove(session_id);
            log::debug!("Sticky session rebind: node {node_id} is no longer eligible");
            return None;
        }

        Some(session.node_id.clone())
    }

    /// Bind or refresh a session. At capacity, the entry closest to expiry
    /// makes room so the map never exceeds its bound.
    fn bind_session(&self, session_id: &str, node_id: &str) {
        if !self.sessions.contains_key(session_id) && self.sessions.len() >= self.config.max_sessions {
            self.sweep_expired();

            if self.sessions.len() >= self.config.max_sessions {
                let soonest = self
                    .sessions
                    .iter()
                    .min_by_key(|entry| entry.value().expires_at)
                    .map(|entry| entry.key().clone());
                if let Some(evict) = soonest {
                    self.sessions.remove(&evict);
                }
            }
        }

        self.sessions.insert(
            session_id.to_string(),
            StickySession {
                node_id: node_id.to_string(),
                expires_at: Instant::now() + self.config.sticky_ttl,
            },
        );
    }

    /// Drop every expired session.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.sessions.retain(|_, session| session.expires_at > now);
    }

    /// Number of live sticky sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forget a node's routing residue when it leaves the cluster.
    pub fn forget_node(&self, node_id: &str) {
        self.sessions.retain(|_, session| session.node_id != node_id);
        self.last_tools.remove(node_id);
    }

    fn round_robin(&self, candidates: &[&Candidate]) -> RoutingDecision {
        let slot = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        RoutingDecision {
            node_id: candidates[slot].node_id.clone(),
            reason: RoutingReason::RoundRobin,
            confidence: 1.0,
        }
    }

    fn least_loaded(candidates: &[&Candidate]) -> RoutingDecision {
        // Stable id order makes the final tie-break deterministic.
        let chosen = candidates
            .iter()
            .min_by(|a, b| {
                a.in_flight
                    .cmp(&b.in_flight)
                    .then_with(|| latency_key(a.average_latency).cmp(&latency_key(b.average_latency)))
            })
            .expect("candidates checked non-empty");

        RoutingDecision {
            node_id: chosen.node_id.clone(),
            reason: RoutingReason::LeastLoaded,
            confidence: 1.0,
        }
    }

    fn lowest_latency(candidates: &[&Candidate]) -> RoutingDecision {
        let chosen = candidates
            .iter()
            .min_by_key(|candidate| latency_key(candidate.average_latency))
            .expect("candidates checked non-empty");

        RoutingDecision {
            node_id: chosen.node_id.clone(),
            reason: RoutingReason::Latency,
            confidence: 1.0,
        }
    }

    fn cache_aware(&self, candidates: &[&Candidate], context: &RoutingContext) -> RoutingDecision {
        let any_prefix_match = candidates
            .iter()
            .any(|candidate| candidate.cache_prefix_hash.as_deref() == Some(context.system_prompt_hash.as_str()));

        if !any_prefix_match {
            // Nothing to gain from affinity; spread the load instead.
            let mut decision = self.round_robin(candidates);
            decision.reason = RoutingReason::CacheAware;
            decision.confidence = 0.0;
            return decision;
        }

        let mut best: Option<(&Candidate, f64)> = None;

        for candidate in candidates {
            let score = self.score(candidate, context);
            let replace = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if replace {
                best = Some((candidate, score));
            }
        }

        let (chosen, score) = best.expect("candidates checked non-empty");

        RoutingDecision {
            node_id: chosen.node_id.clone(),
            reason: RoutingReason::CacheAware,
            confidence: score / MAX_SCORE,
        }
    }

    fn score(&self, candidate: &Candidate, context: &RoutingContext) -> f64 {
        let mut score = 0.0;

        let prefix_match = candidate.cache_prefix_hash.as_deref() == Some(context.system_prompt_hash.as_str());
        if prefix_match {
            score += PREFIX_MATCH_SCORE;

            // Tool affinity only means anything on top of a prefix match.
            let tools_match = self
                .last_tools
                .get(&candidate.node_id)
                .is_some_and(|last| *last == context.tools_hash);
            if tools_match {
                score += TOOLS_MATCH_SCORE;
            }
        }

        score += SUCCESS_RATE_SCORE * candidate.success_rate.clamp(0.0, 1.0);

        if candidate.in_flight < LOW_LOAD_THRESHOLD {
            score += LOW_LOAD_SCORE;
        }

        if candidate.cache_age.is_some_and(|age| age <= FRESHNESS_WINDOW) {
            score += FRESHNESS_SCORE;
        }

        score
    }
}

fn latency_key(latency: Option<Duration>) -> Duration {
    latency.unwrap_or(Duration::MAX)
}
