//! Per-backend circuit breakers.
//!
//! Each backend gets a three-state machine: `Closed` (traffic flows, counting
//! consecutive failures), `Open` (traffic rejected until `next_attempt`), and
//! `HalfOpen` (a bounded number of trial requests probe recovery). A failed
//! trial re-opens with a doubled cooldown, capped; a successful trial closes
//! and clears the failure count.
//!
//! The registry owns all state in a [`DashMap`] keyed by backend id, so
//! transitions for the same backend are serialized by the entry lock while
//! unrelated backends never contend. The trial slot in half-open is claimed
//! under that same lock: of K concurrent callers, exactly the configured
//! number get through as trials.

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::CircuitBreakerSettings;

/// State machine for one backend.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation, counting consecutive failures
    Closed { failure_count: u32 },

    /// Rejecting traffic until `next_attempt`
    Open {
        opened_at: Instant,
        next_attempt: Instant,
        /// The cooldown that produced `next_attempt`; doubled on a failed trial
        cooldown: Duration,
    },

    /// Probing recovery with a bounded number of trials
    HalfOpen {
        trials_started: u32,
        /// Carried from the open period so a failed trial can double it
        cooldown: Duration,
    },
}

impl CircuitState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

/// Per-backend record: state plus the timestamps introspection reports.
#[derive(Debug, Clone)]
struct BreakerRecord {
    state: CircuitState,
    state_changed_at: Instant,
    last_failure_at: Option<Instant>,
}

impl BreakerRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed { failure_count: 0 },
            state_changed_at: Instant::now(),
            last_failure_at: None,
        }
    }

    fn transition(&mut self, next: CircuitState, now: Instant) {
        self.state = next;
        self.state_changed_at = now;
    }
}

/// Serializable view of one breaker for the introspection API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub backend: String,
    pub state: String,
    pub failure_count: u32,
    /// Seconds until the next trial is permitted (open state only)
    pub retry_in_secs: Option<u64>,
    /// Current cooldown length (open and half-open states)
    pub cooldown_secs: Option<u64>,
    pub state_changed_secs_ago: u64,
    pub last_failure_secs_ago: Option<u64>,
}

/// Registry of per-backend circuit breakers.
pub struct CircuitBreaker {
    states: DashMap<String, BreakerRecord>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            states: DashMap::new(),
            settings,
        }
    }

    /// Ensure a breaker exists for the backend (created closed).
    pub fn register(&self, backend: &str) {
        self.states
            .entry(backend.to_string())
            .or_insert_with(BreakerRecord::new);
    }

    /// Check whether a request may be sent to the backend, claiming a trial
    /// slot when the breaker is half-open.
    ///
    /// This is the gate called at dispatch time. An open breaker whose
    /// cooldown has elapsed transitions to half-open here, and the caller
    /// becomes the first trial.
    pub fn allow(&self, backend: &str) -> bool {
        let now = Instant::now();
        let mut record = self
            .states
            .entry(backend.to_string())
            .or_insert_with(BreakerRecord::new);

        match record.state {
            CircuitState::Closed { .. } => true,
            CircuitState::Open {
                next_attempt,
                cooldown,
                ..
            } => {
                if now >= next_attempt {
                    record.transition(
                        CircuitState::HalfOpen {
                            trials_started: 1,
                            cooldown,
                        },
                        now,
                    );
                    counter!("gateway_breaker_transitions_total", "state" => "half_open")
                        .increment(1);
                    debug!(backend, "Circuit breaker half-open, trial dispatched");
                    true
                } else {
                    counter!("gateway_breaker_rejections_total").increment(1);
                    false
                }
            }
            CircuitState::HalfOpen {
                trials_started,
                cooldown,
            } => {
                if trials_started < self.settings.half_open_trials {
                    record.state = CircuitState::HalfOpen {
                        trials_started: trials_started + 1,
                        cooldown,
                    };
                    true
                } else {
                    counter!("gateway_breaker_rejections_total").increment(1);
                    false
                }
            }
        }
    }

    /// Whether a request to the backend would currently be allowed, without
    /// claiming anything.
    ///
    /// Used by candidate filtering; an open breaker past its `next_attempt`
    /// counts as allowed so the backend stays selectable for a trial.
    pub fn would_allow(&self, backend: &str) -> bool {
        match self.states.get(backend) {
            None => true,
            Some(record) => match record.state {
                CircuitState::Closed { .. } => true,
                CircuitState::Open { next_attempt, .. } => Instant::now() >= next_attempt,
                CircuitState::HalfOpen { trials_started, .. } => {
                    trials_started < self.settings.half_open_trials
                }
            },
        }
    }

    /// Report the outcome of a completed attempt against the backend.
    ///
    /// `threshold` is the policy's consecutive-failure limit for opening.
    /// Outcomes arriving after the breaker already opened (from requests
    /// dispatched before the transition) are ignored.
    pub fn report_outcome(&self, backend: &str, success: bool, threshold: u32) {
        let now = Instant::now();
        let mut record = self
            .states
            .entry(backend.to_string())
            .or_insert_with(BreakerRecord::new);

        if success {
            match record.state {
                CircuitState::Closed { failure_count } if failure_count > 0 => {
                    record.state = CircuitState::Closed { failure_count: 0 };
                }
                CircuitState::HalfOpen { .. } => {
                    record.transition(CircuitState::Closed { failure_count: 0 }, now);
                    counter!("gateway_breaker_transitions_total", "state" => "closed")
                        .increment(1);
                    info!(backend, "Circuit breaker closed, backend recovered");
                }
                _ => {}
            }
            return;
        }

        record.last_failure_at = Some(now);
        match record.state {
            CircuitState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= threshold.max(1) {
                    let cooldown = self.settings.cooldown;
                    record.transition(
                        CircuitState::Open {
                            opened_at: now,
                            next_attempt: now + cooldown,
                            cooldown,
                        },
                        now,
                    );
                    counter!("gateway_breaker_transitions_total", "state" => "open").increment(1);
                    warn!(
                        backend,
                        failures = failure_count,
                        cooldown_secs = cooldown.as_secs(),
                        "Circuit breaker opened"
                    );
                } else {
                    record.state = CircuitState::Closed { failure_count };
                }
            }
            CircuitState::HalfOpen { cooldown, .. } => {
                let cooldown = (cooldown * 2).min(self.settings.max_cooldown);
                record.transition(
                    CircuitState::Open {
                        opened_at: now,
                        next_attempt: now + cooldown,
                        cooldown,
                    },
                    now,
                );
                counter!("gateway_breaker_transitions_total", "state" => "open").increment(1);
                warn!(
                    backend,
                    cooldown_secs = cooldown.as_secs(),
                    "Circuit breaker re-opened after failed trial"
                );
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Move expired open breakers to half-open.
    ///
    /// Request traffic performs this transition in `allow`; the periodic
    /// tick does the same for idle backends so introspection and candidate
    /// filtering see the current state without traffic.
    pub fn tick(&self) {
        let now = Instant::now();
        for mut entry in self.states.iter_mut() {
            if let CircuitState::Open {
                next_attempt,
                cooldown,
                ..
            } = entry.state
            {
                if now >= next_attempt {
                    entry.transition(
                        CircuitState::HalfOpen {
                            trials_started: 0,
                            cooldown,
                        },
                        now,
                    );
                    counter!("gateway_breaker_transitions_total", "state" => "half_open")
                        .increment(1);
                }
            }
        }
    }

    /// Periodic task driving [`tick`](Self::tick).
    pub fn spawn_transition_task(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let breaker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                breaker.tick();
            }
        })
    }

    /// Current state for one backend, if registered.
    pub fn state(&self, backend: &str) -> Option<CircuitState> {
        self.states.get(backend).map(|r| r.state.clone())
    }

    /// Snapshots of every breaker, sorted by backend id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<BreakerSnapshot> = self
            .states
            .iter()
            .map(|entry| {
                let record = entry.value();
                let (failure_count, retry_in_secs, cooldown_secs) = match record.state {
                    CircuitState::Closed { failure_count } => (failure_count, None, None),
                    CircuitState::Open {
                        next_attempt,
                        cooldown,
                        ..
                    } => (
                        0,
                        Some(next_attempt.saturating_duration_since(now).as_secs()),
                        Some(cooldown.as_secs()),
                    ),
                    CircuitState::HalfOpen { cooldown, .. } => (0, None, Some(cooldown.as_secs())),
                };
                BreakerSnapshot {
                    backend: entry.key().clone(),
                    state: record.state.name().to_string(),
                    failure_count,
                    retry_in_secs,
                    cooldown_secs,
                    state_changed_secs_ago: now
                        .saturating_duration_since(record.state_changed_at)
                        .as_secs(),
                    last_failure_secs_ago: record
                        .last_failure_at
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn settings(cooldown_ms: u64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            cooldown: Duration::from_millis(cooldown_ms),
            max_cooldown: Duration::from_millis(cooldown_ms * 8),
            half_open_trials: 1,
        }
    }

    fn open_breaker(breaker: &CircuitBreaker, backend: &str, threshold: u32) {
        for _ in 0..threshold {
            breaker.report_outcome(backend, false, threshold);
        }
    }

    #[test]
    fn test_initial_state_allows() {
        let breaker = CircuitBreaker::new(settings(100));
        assert!(breaker.allow("llm-0"));
        assert!(breaker.would_allow("llm-0"));
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::Closed { failure_count: 0 })
        ));
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(settings(100));

        breaker.report_outcome("llm-0", false, 3);
        breaker.report_outcome("llm-0", false, 3);
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::Closed { failure_count: 2 })
        ));

        breaker.report_outcome("llm-0", false, 3);
        assert!(matches!(breaker.state("llm-0"), Some(CircuitState::Open { .. })));
        assert!(!breaker.allow("llm-0"));
        assert!(!breaker.would_allow("llm-0"));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new(settings(100));

        breaker.report_outcome("llm-0", false, 3);
        breaker.report_outcome("llm-0", false, 3);
        breaker.report_outcome("llm-0", true, 3);
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::Closed { failure_count: 0 })
        ));

        // Two more failures after the reset must not open.
        breaker.report_outcome("llm-0", false, 3);
        breaker.report_outcome("llm-0", false, 3);
        assert!(matches!(breaker.state("llm-0"), Some(CircuitState::Closed { .. })));
    }

    #[test]
    fn test_cooldown_elapses_into_half_open_trial() {
        let breaker = CircuitBreaker::new(settings(50));
        open_breaker(&breaker, "llm-0", 2);
        assert!(!breaker.allow("llm-0"));

        thread::sleep(Duration::from_millis(80));

        assert!(breaker.would_allow("llm-0"));
        assert!(breaker.allow("llm-0"));
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::HalfOpen { trials_started: 1, .. })
        ));

        // The single trial slot is taken.
        assert!(!breaker.allow("llm-0"));
        assert!(!breaker.would_allow("llm-0"));
    }

    #[test]
    fn test_trial_success_closes() {
        let breaker = CircuitBreaker::new(settings(50));
        open_breaker(&breaker, "llm-0", 2);
        thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow("llm-0"));

        breaker.report_outcome("llm-0", true, 2);
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::Closed { failure_count: 0 })
        ));
        assert!(breaker.allow("llm-0"));
    }

    #[test]
    fn test_trial_failure_doubles_cooldown() {
        let breaker = CircuitBreaker::new(settings(50));
        open_breaker(&breaker, "llm-0", 2);
        thread::sleep(Duration::from_millis(80));
        assert!(breaker.allow("llm-0"));

        breaker.report_outcome("llm-0", false, 2);
        match breaker.state("llm-0") {
            Some(CircuitState::Open { cooldown, .. }) => {
                assert_eq!(cooldown, Duration::from_millis(100));
            }
            other => panic!("expected open state, got {other:?}"),
        }
        assert!(!breaker.allow("llm-0"));
    }

    #[test]
    fn test_cooldown_doubling_is_capped() {
        let mut s = settings(50);
        s.max_cooldown = Duration::from_millis(120);
        let breaker = CircuitBreaker::new(s);

        // Fail two trials in a row: 50ms -> 100ms -> capped at 120ms.
        open_breaker(&breaker, "llm-0", 1);
        for expected_ms in [100u64, 120] {
            thread::sleep(Duration::from_millis(expected_ms + 30));
            assert!(breaker.allow("llm-0"));
            breaker.report_outcome("llm-0", false, 1);
            match breaker.state("llm-0") {
                Some(CircuitState::Open { cooldown, .. }) => {
                    assert_eq!(cooldown, Duration::from_millis(expected_ms));
                }
                other => panic!("expected open state, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_concurrent_callers_claim_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new(settings(50)));
        open_breaker(&breaker, "llm-0", 1);
        thread::sleep(Duration::from_millis(80));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || breaker.allow("llm-0"))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&admitted| admitted)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_late_outcomes_ignored_while_open() {
        let breaker = CircuitBreaker::new(settings(10_000));
        open_breaker(&breaker, "llm-0", 2);

        // Outcomes from requests dispatched before the transition.
        breaker.report_outcome("llm-0", true, 2);
        assert!(matches!(breaker.state("llm-0"), Some(CircuitState::Open { .. })));
        breaker.report_outcome("llm-0", false, 2);
        assert!(matches!(breaker.state("llm-0"), Some(CircuitState::Open { .. })));
    }

    #[test]
    fn test_backends_are_independent() {
        let breaker = CircuitBreaker::new(settings(10_000));
        open_breaker(&breaker, "llm-0", 2);

        assert!(!breaker.allow("llm-0"));
        assert!(breaker.allow("llm-1"));
    }

    #[test]
    fn test_tick_transitions_idle_open_breaker() {
        let breaker = CircuitBreaker::new(settings(50));
        open_breaker(&breaker, "llm-0", 1);

        breaker.tick();
        assert!(matches!(breaker.state("llm-0"), Some(CircuitState::Open { .. })));

        thread::sleep(Duration::from_millis(80));
        breaker.tick();
        assert!(matches!(
            breaker.state("llm-0"),
            Some(CircuitState::HalfOpen { trials_started: 0, .. })
        ));
    }

    #[test]
    fn test_snapshots_report_state() {
        let breaker = CircuitBreaker::new(settings(10_000));
        breaker.register("llm-0");
        breaker.register("llm-1");
        open_breaker(&breaker, "llm-1", 1);

        let snapshots = breaker.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].backend, "llm-0");
        assert_eq!(snapshots[0].state, "closed");
        assert_eq!(snapshots[1].backend, "llm-1");
        assert_eq!(snapshots[1].state, "open");
        assert!(snapshots[1].retry_in_secs.is_some());
        assert!(snapshots[1].last_failure_secs_ago.is_some());
    }
}
