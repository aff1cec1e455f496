//! Node identity and derived cluster state.

use std::fmt;

use serde::Serialize;

/// Operational state of a worker node. Owned by the health tracker; every
/// transition for a node is serialized under that node's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Discovered but not yet probed successfully.
    Initializing,
    /// Meeting the success-rate bar.
    Healthy,
    /// Reachable but below par; still eligible for traffic.
    Degraded,
    /// Failing; probed on a backoff schedule, not routed to.
    Unhealthy,
    /// Retries keep failing; effectively gone until it recovers.
    Offline,
}

impl NodeState {
    /// Whether the router may send traffic to a node in this state.
    pub fn is_eligible(self) -> bool {
        matches!(self, NodeState::Healthy | NodeState::Degraded)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Initializing => "initializing",
            NodeState::Healthy => "healthy",
            NodeState::Degraded => "degraded",
            NodeState::Unhealthy => "unhealthy",
            NodeState::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Cluster status derived from the multiset of node states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// No node has completed its first probe yet.
    Starting,
    /// Every node is healthy.
    Healthy,
    /// Some nodes are impaired but capacity is adequate.
    Degraded,
    /// At most a third of the fleet is still taking traffic.
    Critical,
    /// Every node is offline (or there are no nodes).
    Offline,
}

impl ClusterStatus {
    /// Derive the status from current node states.
    pub fn derive(states: &[NodeState]) -> Self {
        if states.is_empty() {
            return ClusterStatus::Offline;
        }

        if states.iter().all(|state| *state == NodeState::Initializing) {
            return ClusterStatus::Starting;
        }

        if states.iter().all(|state| *state == NodeState::Offline) {
            return ClusterStatus::Offline;
        }

        if states.iter().all(|state| *state == NodeState::Healthy) {
            return ClusterStatus::Healthy;
        }

        let eligible = states.iter().filter(|state| state.is_eligible()).count();
        if eligible <= states.len() / 3 {
            return ClusterStatus::Critical;
        }

        ClusterStatus::Degraded
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterStatus::Starting => "starting",
            ClusterStatus::Healthy => "healthy",
            ClusterStatus::Degraded => "degraded",
            ClusterStatus::Critical => "critical",
            ClusterStatus::Offline => "offline",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use NodeState::{Degraded, Healthy, Initializing, Offline, Unhealthy};

    #[test]
    fn all_healthy_is_healthy() {
        assert_eq!(ClusterStatus::derive(&[Healthy, Healthy, Healthy]), ClusterStatus::Healthy);
    }

    #[test]
    fn all_offline_is_offline() {
        assert_eq!(ClusterStatus::derive(&[Offline, Offline]), ClusterStatus::Offline);
        assert_eq!(ClusterStatus::derive(&[]), ClusterStatus::Offline);
    }

    #[test]
    fn unprobed_fleet_is_starting() {
        assert_eq!(
            ClusterStatus::derive(&[Initializing, Initializing]),
            ClusterStatus::Starting
        );
    }

    #[test]
    fn one_third_eligible_is_critical() {
        // 1 of 3 eligible: 1 <= floor(3/3).
        assert_eq!(
            ClusterStatus::derive(&[Healthy, Unhealthy, Offline]),
            ClusterStatus::Critical
        );

        // 2 of 6 eligible: 2 <= floor(6/3).
        assert_eq!(
            ClusterStatus::derive(&[Healthy, Degraded, Unhealthy, Unhealthy, Offline, Offline]),
            ClusterStatus::Critical
        );
    }

    #[test]
    fn majority_eligible_is_degraded() {
        assert_eq!(
            ClusterStatus::derive(&[Healthy, Healthy, Unhealthy]),
            ClusterStatus::Degraded
        );
        assert_eq!(
            ClusterStatus::derive(&[Healthy, Degraded, Degraded]),
            ClusterStatus::Degraded
        );
    }
}
