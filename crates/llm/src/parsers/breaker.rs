//! Circuit breaker guarding a fallible operation.
//!
//! The state machine is a tagged sum behind a mutex. The lock is held only
//! for state reads and transitions; the wrapped operation always runs
//! outside it. Transition history is kept in a bounded ring so a flapping
//! breaker cannot grow without bound.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use thiserror::Error;

/// Number of retained state transitions. Older entries are silently dropped.
const HISTORY_LIMIT: usize = 10_000;

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before admitting a trial call.
    pub recovery_timeout: Duration,
    /// Successful trial calls required to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls are rejected without invoking the operation.
    Open,
    /// One trial call at a time is admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker `{0}` is open")]
    Rejected(String),
    /// The operation ran and failed.
    #[error(transparent)]
    Operation(E),
}

/// A recorded state transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
    /// When the transition happened.
    pub at: jiff::Timestamp,
    /// Why.
    pub reason: String,
    /// Consecutive-failure counter at transition time.
    pub consecutive_failures: u32,
}

enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

impl State {
    fn observable(&self) -> CircuitState {
        match self {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    half_open_successes: u32,
    rejected_while_open: u64,
    history: VecDeque<Transition>,
}

impl Inner {
    fn transition(&mut self, to: State, reason: impl Into<String>) {
        let from = self.state.observable();
        let to_observable = to.observable();

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to: to_observable,
            at: jiff::Timestamp::now(),
            reason: reason.into(),
            consecutive_failures: self.consecutive_failures,
        });

        self.state = to;
    }
}

/// Circuit breaker around one protected resource.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker named for its protected resource.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                rejected_while_open: 0,
                history: VecDeque::new(),
            }),
        }
    }

    /// Run `operation` under the breaker. The operation is invoked outside
    /// the breaker's lock.
    pub fn call<T, E>(&self, operation: impl FnOnce() -> Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        self.admit()?;

        match operation() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(error))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match &inner.state {
            State::Closed => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.recovery_timeout {
                    inner.transition(
                        State::HalfOpen { trial_in_flight: true },
                        "recovery timeout elapsed; admitting trial call",
                    );
                    Ok(())
                } else {
                    inner.rejected_while_open += 1;
                    Err(CircuitBreakerError::Rejected(self.name.clone()))
                }
            }
            State::HalfOpen { trial_in_flight } => {
                if *trial_in_flight {
                    inner.rejected_while_open += 1;
                    Err(CircuitBreakerError::Rejected(self.name.clone()))
                } else {
                    inner.state = State::HalfOpen { trial_in_flight: true };
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");

        match &inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
            }
            State::HalfOpen { .. } => {
                inner.half_open_successes += 1;

                if inner.half_open_successes >= self.config.success_threshold {
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.transition(State::Closed, "trial call(s) succeeded");
                } else {
                    inner.state = State::HalfOpen { trial_in_flight: false };
                }
            }
            State::Open { .. } => {
                // A success from a call admitted before the trip; the trip
                // decision stands.
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;

        match &inner.state {
            State::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    inner.transition(
                        State::Open { since: Instant::now() },
                        format!("{failures} consecutive failures"),
                    );
                    log::warn!("Circuit breaker `{}` tripped after {failures} consecutive failures", self.name);
                }
            }
            State::HalfOpen { .. } => {
                inner.half_open_successes = 0;
                inner.transition(State::Open { since: Instant::now() }, "trial call failed");
                log::warn!("Circuit breaker `{}` re-opened: trial call failed", self.name);
            }
            State::Open { .. } => {}
        }
    }

    /// Current observable state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state.observable()
    }

    /// Current consecutive-failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").consecutive_failures
    }

    /// Calls rejected while the breaker was open or mid-trial.
    pub fn rejected_calls(&self) -> u64 {
        self.inner.lock().expect("breaker lock poisoned").rejected_while_open
    }

    /// Snapshot of the retained transition history.
    pub fn history(&self) -> Vec<Transition> {
        self.inner
            .lock()
            .expect("breaker lock poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_call(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        breaker.call(|| Err("boom"))
    }

    #[test]
    fn trips_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(
            "parsers",
            CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_millis(50),
                success_threshold: 1,
            },
        );

        for _ in 0..5 {
            assert!(matches!(failing_call(&breaker), Err(CircuitBreakerError::Operation(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Open: rejected without invoking the operation.
        let mut invoked = false;
        let result: Result<(), CircuitBreakerError<&'static str>> = breaker.call(|| {
            invoked = true;
            Ok(())
        });
        assert!(matches!(result, Err(CircuitBreakerError::Rejected(_))));
        assert!(!invoked);
        assert_eq!(breaker.rejected_calls(), 1);

        // After the recovery timeout the next call is admitted as a trial
        // and its success closes the breaker.
        std::thread::sleep(Duration::from_millis(60));
        let result: Result<(), CircuitBreakerError<&'static str>> = breaker.call(|| Ok(()));
        assert!(result.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new(
            "parsers",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(20),
                success_threshold: 1,
            },
        );

        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_in_closed_state_resets_failures() {
        let breaker = CircuitBreaker::new("parsers", CircuitBreakerConfig::default());

        assert!(failing_call(&breaker).is_err());
        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.consecutive_failures(), 2);

        let result: Result<(), CircuitBreakerError<&'static str>> = breaker.call(|| Ok(()));
        assert!(result.is_ok());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn history_is_bounded() {
        let breaker = CircuitBreaker::new(
            "parsers",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::ZERO,
                success_threshold: 1,
            },
        );

        // Each cycle records Closed→Open, Open→HalfOpen, HalfOpen→Closed.
        for _ in 0..4_000 {
            let _ = failing_call(&breaker);
            let _: Result<(), CircuitBreakerError<&'static str>> = breaker.call(|| Ok(()));
        }

        assert_eq!(breaker.history().len(), HISTORY_LIMIT);
    }

    #[test]
    fn transitions_record_reasons() {
        let breaker = CircuitBreaker::new(
            "parsers",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
        );

        let _ = failing_call(&breaker);
        let _ = failing_call(&breaker);

        let history = breaker.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from, CircuitState::Closed);
        assert_eq!(history[0].to, CircuitState::Open);
        assert_eq!(history[0].consecutive_failures, 2);
        assert!(history[0].reason.contains("consecutive failures"));
    }
}
