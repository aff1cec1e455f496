//! Per-node health tracking.
//!
//! Each node carries a small circuit-breaker state machine
//! (Healthy/Degraded/Unhealthy/Offline) driven by two outcome sources: the
//! periodic probe loop and request results funneled in by the proxy. All
//! mutation of a node's record happens under that node's own lock, so state
//! transitions per node are totally ordered and probing one node never
//! contends with another.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use llm::provider::NodeProvider;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::node::NodeState;

/// Maximum retained outcomes per node; the time window prunes harder in
/// practice.
const OUTCOME_CAPACITY: usize = 256;

/// A single observed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded within its deadline.
    Success {
        /// Observed latency.
        latency: Duration,
    },
    /// The call hit its deadline.
    Timeout,
    /// The node was unreachable.
    NetworkError,
    /// The node answered with an error status.
    HttpError,
}

impl Outcome {
    fn is_success(self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// Read-only view of a node's health.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Current state.
    pub state: NodeState,
    /// Consecutive failures observed.
    pub consecutive_failures: u32,
    /// Success rate over the rolling window; 1.0 with no samples.
    pub success_rate: f64,
    /// Error rate over the rolling window.
    pub error_rate: f64,
    /// Mean latency of successful calls in the window.
    pub average_latency: Option<Duration>,
    /// Samples currently in the window.
    pub sample_count: usize,
    /// When the node was last probed.
    pub last_check: Option<Instant>,
}

/// A state transition notification.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// The node that transitioned.
    pub node_id: String,
    /// State before.
    pub from: NodeState,
    /// State after.
    pub to: NodeState,
    /// Why.
    pub reason: String,
}

struct HealthRecord {
    state: NodeState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    outcomes: VecDeque<(Instant, Outcome)>,
    backoff_attempt: u32,
    next_retry_at: Option<Instant>,
    last_check: Option<Instant>,
    probe_in_flight: bool,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            state: NodeState::Initializing,
            consecutive_failures: 0,
            consecutive_successes: 0,
            outcomes: VecDeque::new(),
            backoff_attempt: 0,
            next_retry_at: None,
            last_check: None,
            probe_in_flight: false,
        }
    }

    fn prune(&mut self, window: Duration) {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while let Some((at, _)) = self.outcomes.front() {
                if *at < cutoff {
                    self.outcomes.pop_front();
                } else {
                    break;
                }
            }
        }
        while self.outcomes.len() > OUTCOME_CAPACITY {
            self.outcomes.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|(_, outcome)| outcome.is_success()).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn average_latency(&self) -> Option<Duration> {
        let latencies: Vec<Duration> = self
            .outcomes
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                Outcome::Success { latency } => Some(*latency),
                _ => None,
            })
            .collect();

        if latencies.is_empty() {
            return None;
        }

        Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
    }

    fn snapshot(&self) -> HealthSnapshot {
        let success_rate = self.success_rate();
        HealthSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            success_rate,
            error_rate: 1.0 - success_rate,
            average_latency: self.average_latency(),
            sample_count: self.outcomes.len(),
            last_check: self.last_check,
        }
    }
}

struct TrackedNode {
    provider: NodeProvider,
    record: Mutex<HealthRecord>,
}

/// Health tracker for the whole fleet.
pub struct HealthTracker {
    config: config::HealthTrackerConfig,
    nodes: DashMap<String, Arc<TrackedNode>>,
    events: UnboundedSender<StateChange>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthTracker {
    /// Build the tracker; the receiver carries state-change notifications.
    pub fn new(config: config::HealthTrackerConfig) -> (Arc<Self>, UnboundedReceiver<StateChange>) {
        let (events, rx) = mpsc::unbounded_channel();

        let tracker = Arc::new(Self {
            config,
            nodes: DashMap::new(),
            events,
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        });

        (tracker, rx)
    }

    /// Begin tracking a node, starting in `Initializing`.
    pub fn track(&self, node_id: impl Into<String>, provider: NodeProvider) {
        self.nodes.insert(
            node_id.into(),
            Arc::new(TrackedNode {
                provider,
                record: Mutex::new(HealthRecord::new()),
            }),
        );
    }

    /// Stop tracking a node.
    pub fn untrack(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }

    /// Whether the node may receive traffic.
    pub fn is_eligible(&self, node_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|node| node.record.lock().expect("health lock poisoned").state.is_eligible())
            .unwrap_or(false)
    }

    /// Snapshot of one node's health.
    pub fn snapshot(&self, node_id: &str) -> Option<HealthSnapshot> {
        self.nodes.get(node_id).map(|node| {
            let mut record = node.record.lock().expect("health lock poisoned");
            record.prune(self.config.window);
            record.snapshot()
        })
    }

    /// Current states of every tracked node.
    pub fn states(&self) -> Vec<(String, NodeState)> {
        self.nodes
            .iter()
            .map(|entry| {
                let state = entry.value().record.lock().expect("health lock poisoned").state;
                (entry.key().clone(), state)
            })
            .collect()
    }

    /// Record an outcome for a node; request results from the proxy flow
    /// through here as well as probe results.
    pub fn record_outcome(&self, node_id: &str, outcome: Outcome) {
        let Some(node) = self.nodes.get(node_id).map(|entry| Arc::clone(entry.value())) else {
            return;
        };

        let change = {
            let mut record = node.record.lock().expect("health lock poisoned");
            self.apply_outcome(&mut record, outcome)
        };

        if let Some((from, to, reason)) = change {
            log::info!("Node {node_id}: {from} -> {to} ({reason})");
            let _ = self.events.send(StateChange {
                node_id: node_id.to_string(),
                from,
                to,
                reason,
            });
        }
    }

    /// Spawn the periodic probe loop.
    pub fn start(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tracker.config.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = tracker.cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }

                tracker.probe_round();
            }
        });

        if let Ok(mut task) = self.task.try_lock() {
            *task = Some(handle);
        }
    }

    /// Cancel the probe loop and join it.
    pub async fn stop(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take()
            && let Err(error) = handle.await
        {
            log::warn!("Health probe task ended abnormally: {error}");
        }
    }

    /// Kick off one probe per due node. Probes run as their own tasks so a
    /// slow node cannot delay the round; a node with a probe still in flight
    /// is skipped.
    fn probe_round(self: &Arc<Self>) {
        let now = Instant::now();

        for entry in self.nodes.iter() {
            let node_id = entry.key().clone();
            let node = Arc::clone(entry.value());

            {
                let mut record = node.record.lock().expect("health lock poisoned");

                if record.probe_in_flight {
                    continue;
                }

                // Unhealthy and offline nodes retry on their backoff
                // schedule rather than every tick.
                if let Some(next_retry) = record.next_retry_at
                    && now < next_retry
                {
                    continue;
                }

                record.probe_in_flight = true;
            }

            let tracker = Arc::clone(self);
            let probe_timeout = self.config.probe_timeout;

            tokio::spawn(async move {
                let outcome = match node.provider.probe(probe_timeout).await {
                    Ok(report) => Outcome::Success { latency: report.latency },
                    Err(llm::LlmError::UpstreamTimeout(_)) => Outcome::Timeout,
                    Err(llm::LlmError::ConnectionError(_)) => Outcome::NetworkError,
                    Err(_) => Outcome::HttpError,
                };

                {
                    let mut record = node.record.lock().expect("health lock poisoned");
                    record.probe_in_flight = false;
                    record.last_check = Some(Instant::now());
                }

                tracker.record_outcome(&node_id, outcome);
            });
        }
    }

    /// Apply one outcome to a record and return the transition, if any.
    /// Caller holds the node's lock.
    fn apply_outcome(&self, record: &mut HealthRecord, outcome: Outcome) -> Option<(NodeState, NodeState, String)> {
        let config = &self.config;

        record.outcomes.push_back((Instant::now(), outcome));
        record.prune(config.window);

        if outcome.is_success() {
            record.consecutive_failures = 0;
            record.consecutive_successes += 1;
        } else {
            record.consecutive_successes = 0;
            record.consecutive_failures += 1;
        }

        let success_rate = record.success_rate();
        let from = record.state;

        let to = match (from, outcome.is_success()) {
            (NodeState::Initializing, true) => NodeState::Healthy,
            (NodeState::Initializing, false) => {
                if record.consecutive_failures >= config.max_consecutive_failures {
                    NodeState::Unhealthy
                } else {
                    NodeState::Initializing
                }
            }
            (NodeState::Healthy, true) => NodeState::Healthy,
            (NodeState::Healthy, false) => {
                if record.consecutive_failures >= config.max_consecutive_failures
                    || success_rate < config.unhealthy_success_rate
                {
                    NodeState::Unhealthy
                } else if success_rate < config.degraded_success_rate {
                    NodeState::Degraded
                } else {
                    NodeState::Healthy
                }
            }
            (NodeState::Degraded, true) => {
                if success_rate >= config.degraded_success_rate {
                    NodeState::Healthy
                } else {
                    NodeState::Degraded
                }
            }
            (NodeState::Degraded, false) => {
                if record.consecutive_failures >= config.max_consecutive_failures
                    || success_rate < config.unhealthy_success_rate
                {
                    NodeState::Unhealthy
                } else {
                    NodeState::Degraded
                }
            }
            (NodeState::Unhealthy | NodeState::Offline, true) => {
                if record.consecutive_successes >= config.success_threshold {
                    NodeState::Healthy
                } else {
                    from
                }
            }
            (NodeState::Unhealthy, false) => {
                let delay = backoff_delay(&config.backoff, record.backoff_attempt);
                record.backoff_attempt += 1;
                record.next_retry_at = Some(Instant::now() + delay);

                // Once the schedule has flattened against its cap the node
                // has been failing for a long time.
                if delay >= config.backoff.max {
                    NodeState::Offline
                } else {
                    NodeState::Unhealthy
                }
            }
            (NodeState::Offline, false) => {
                record.next_retry_at = Some(Instant::now() + config.backoff.max);
                NodeState::Offline
            }
        };

        if to == NodeState::Healthy {
            record.backoff_attempt = 0;
            record.next_retry_at = None;
        }

        if to == from {
            return None;
        }

        record.state = to;

        let reason = if outcome.is_success() {
            format!("{} consecutive successes", record.consecutive_successes)
        } else {
            format!(
                "{} consecutive failures, success rate {:.2}",
                record.consecutive_failures, success_rate
            )
        };

        Some((from, to, reason))
    }
}

fn backoff_delay(config: &config::BackoffConfig, attempt: u32) -> Duration {
    let delay = config.initial.as_secs_f64() * config.multiplier.powi(attempt as i32);
    Duration::from_secs_f64(delay.min(config.max.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn tracker_with(config: config::HealthTrackerConfig) -> (Arc<HealthTracker>, UnboundedReceiver<StateChange>) {
        let (tracker, rx) = HealthTracker::new(config);
        let provider = NodeProvider::new(
            "w0",
            &Url::parse("http://127.0.0.1:1").unwrap(),
            &config::LlmConfig::default(),
        );
        tracker.track("w0", provider);
        (tracker, rx)
    }

    fn success() -> Outcome {
        Outcome::Success {
            latency: Duration::from_millis(10),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = config::BackoffConfig::default();

        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(32));
        assert_eq!(backoff_delay(&config, 6), Duration::from_secs(60));
        assert_eq!(backoff_delay(&config, 20), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn first_success_promotes_initializing_node() {
        let (tracker, mut rx) = tracker_with(config::HealthTrackerConfig::default());

        tracker.record_outcome("w0", success());

        assert!(tracker.is_eligible("w0"));
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, NodeState::Initializing);
        assert_eq!(change.to, NodeState::Healthy);
    }

    #[tokio::test]
    async fn failure_burst_degrades_then_fails_node() {
        let (tracker, mut rx) = tracker_with(config::HealthTrackerConfig::default());

        // Healthy baseline.
        for _ in 0..5 {
            tracker.record_outcome("w0", success());
        }
        assert_eq!(rx.recv().await.unwrap().to, NodeState::Healthy);

        // Three consecutive failures: 5/7 = 0.71 < 0.8 trips Degraded on the
        // second, the third hits max_consecutive_failures and goes Unhealthy.
        tracker.record_outcome("w0", Outcome::Timeout);
        tracker.record_outcome("w0", Outcome::Timeout);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, NodeState::Healthy);
        assert_eq!(change.to, NodeState::Degraded);

        tracker.record_outcome("w0", Outcome::Timeout);
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, NodeState::Degraded);
        assert_eq!(change.to, NodeState::Unhealthy);
        assert!(!tracker.is_eligible("w0"));
    }

    #[tokio::test]
    async fn recovery_requires_success_threshold() {
        let (tracker, mut rx) = tracker_with(config::HealthTrackerConfig::default());

        for _ in 0..3 {
            tracker.record_outcome("w0", Outcome::NetworkError);
        }
        assert_eq!(rx.recv().await.unwrap().to, NodeState::Unhealthy);

        // One success is not enough.
        tracker.record_outcome("w0", success());
        assert!(!tracker.is_eligible("w0"));

        for _ in 0..4 {
            tracker.record_outcome("w0", success());
        }

        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, NodeState::Unhealthy);
        assert_eq!(change.to, NodeState::Healthy);
        assert!(tracker.is_eligible("w0"));
    }

    #[tokio::test]
    async fn exhausted_backoff_marks_node_offline() {
        let config = config::HealthTrackerConfig {
            backoff: config::BackoffConfig {
                initial: Duration::from_millis(1),
                multiplier: 2.0,
                max: Duration::from_millis(4),
            },
            ..Default::default()
        };
        let (tracker, _rx) = tracker_with(config);

        // Initializing -> Unhealthy after three failures, then keep failing
        // until the backoff schedule caps out.
        for _ in 0..10 {
            tracker.record_outcome("w0", Outcome::NetworkError);
        }

        let states = tracker.states();
        assert_eq!(states[0].1, NodeState::Offline);
    }

    #[tokio::test]
    async fn snapshot_reports_window_statistics() {
        let (tracker, _rx) = tracker_with(config::HealthTrackerConfig::default());

        tracker.record_outcome("w0", success());
        tracker.record_outcome("w0", success());
        tracker.record_outcome("w0", Outcome::HttpError);

        let snapshot = tracker.snapshot("w0").unwrap();
        assert_eq!(snapshot.sample_count, 3);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.average_latency, Some(Duration::from_millis(10)));
        assert_eq!(snapshot.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn unknown_node_is_not_eligible() {
        let (tracker, _rx) = tracker_with(config::HealthTrackerConfig::default());
        assert!(!tracker.is_eligible("nope"));
        assert!(tracker.snapshot("nope").is_none());
    }
}
