//! Health- and circuit-aware backend selection.
//!
//! The balancer filters a candidate set down to backends whose circuit
//! breaker admits traffic and whose health is not `Unhealthy`, preferring
//! `Healthy` backends over never-observed `Unknown` ones. Among the surviving
//! pool it picks the least effective load, where effective load is the
//! current in-flight count scaled inversely by the configured weight; ties go
//! to the least recently selected backend.
//!
//! Selection returns an [`InFlightGuard`] that decrements the chosen
//! backend's in-flight count when dropped, so the count stays accurate on
//! every exit path including panics and cancelled dispatches.

use dashmap::DashMap;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Backend, HealthStatus};
use crate::health::HealthMonitor;

/// Per-backend selection state.
#[derive(Debug, Default)]
struct BackendLoad {
    in_flight: AtomicUsize,
    /// Global selection sequence number at the last time this backend won
    last_selected_seq: AtomicU64,
    selections: AtomicU64,
}

/// Decrements the backend's in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: String,
    load: Arc<BackendLoad>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.load.in_flight.fetch_sub(1, Ordering::AcqRel);
        gauge!("gateway_backend_in_flight", "backend" => self.backend.clone()).decrement(1.0);
    }
}

pub struct LoadBalancer {
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    loads: DashMap<String, Arc<BackendLoad>>,
    selection_seq: AtomicU64,
}

impl LoadBalancer {
    pub fn new(breaker: Arc<CircuitBreaker>, health: Arc<HealthMonitor>) -> Self {
        Self {
            breaker,
            health,
            loads: DashMap::new(),
            selection_seq: AtomicU64::new(0),
        }
    }

    /// Pick a backend for the service class from the given candidates.
    ///
    /// Candidates a retry has already tried should be filtered out by the
    /// caller before this call. Fails with `NoHealthyBackend` when filtering
    /// leaves nothing; callers surface that as service-unavailable rather
    /// than retrying.
    pub fn select(
        &self,
        service_class: &str,
        candidates: &[Arc<Backend>],
    ) -> GatewayResult<(Arc<Backend>, InFlightGuard)> {
        let started = Instant::now();

        let eligible: Vec<&Arc<Backend>> = candidates
            .iter()
            .filter(|backend| self.breaker.would_allow(&backend.id))
            .filter(|backend| self.health.status(&backend.id) != HealthStatus::Unhealthy)
            .collect();

        if eligible.is_empty() {
            counter!("gateway_selection_failures_total").increment(1);
            warn!(
                service_class,
                candidates = candidates.len(),
                "No eligible backend after circuit and health filtering"
            );
            return Err(GatewayError::no_healthy_backend(service_class));
        }

        // Unknown backends are eligible but only serve when nothing healthy
        // remains.
        let healthy: Vec<&Arc<Backend>> = eligible
            .iter()
            .filter(|backend| self.health.status(&backend.id) == HealthStatus::Healthy)
            .copied()
            .collect();
        let pool: &[&Arc<Backend>] = if healthy.is_empty() { &eligible } else { &healthy };

        let chosen = pool
            .iter()
            .min_by(|a, b| {
                let (a_in_flight, a_seq) = self.load_of(&a.id);
                let (b_in_flight, b_seq) = self.load_of(&b.id);
                // in_flight_a / weight_a < in_flight_b / weight_b, compared
                // without division.
                let a_scaled = a_in_flight * u64::from(b.weight.max(1));
                let b_scaled = b_in_flight * u64::from(a.weight.max(1));
                a_scaled.cmp(&b_scaled).then(a_seq.cmp(&b_seq))
            })
            .copied()
            .ok_or_else(|| GatewayError::no_healthy_backend(service_class))?;

        let load = self.load_entry(&chosen.id);
        let in_flight = load.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        load.last_selected_seq.store(
            self.selection_seq.fetch_add(1, Ordering::Relaxed) + 1,
            Ordering::Relaxed,
        );
        load.selections.fetch_add(1, Ordering::Relaxed);

        counter!("gateway_selections_total").increment(1);
        gauge!("gateway_backend_in_flight", "backend" => chosen.id.clone()).increment(1.0);
        histogram!("gateway_selection_duration_seconds").record(started.elapsed().as_secs_f64());
        debug!(
            backend = %chosen.id,
            service_class,
            in_flight,
            weight = chosen.weight,
            "Selected backend"
        );

        let guard = InFlightGuard {
            backend: chosen.id.clone(),
            load,
        };
        Ok((Arc::clone(chosen), guard))
    }

    /// Current in-flight count for a backend.
    pub fn in_flight(&self, backend: &str) -> usize {
        self.loads
            .get(backend)
            .map(|load| load.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Total times a backend has been selected.
    pub fn selections(&self, backend: &str) -> u64 {
        self.loads
            .get(backend)
            .map(|load| load.selections.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn load_entry(&self, backend: &str) -> Arc<BackendLoad> {
        self.loads
            .entry(backend.to_string())
            .or_insert_with(|| Arc::new(BackendLoad::default()))
            .clone()
    }

    fn load_of(&self, backend: &str) -> (u64, u64) {
        self.loads
            .get(backend)
            .map(|load| {
                (
                    load.in_flight.load(Ordering::Acquire) as u64,
                    load.last_selected_seq.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CircuitBreakerSettings;
    use crate::core::config::HealthConfig;
    use std::time::Duration;

    fn components() -> (Arc<CircuitBreaker>, Arc<HealthMonitor>) {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerSettings {
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            half_open_trials: 1,
        }));
        let health = Arc::new(HealthMonitor::new(HealthConfig {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }));
        (breaker, health)
    }

    fn backends(weighted_ids: &[(&str, u32)]) -> Vec<Arc<Backend>> {
        weighted_ids
            .iter()
            .map(|(id, weight)| {
                let mut backend = Backend::new(*id, "llm", format!("http://{id}.local"));
                backend.weight = *weight;
                Arc::new(backend)
            })
            .collect()
    }

    #[test]
    fn test_never_selects_unhealthy() {
        let (breaker, health) = components();
        health.observe("llm-0", false, None);
        health.observe("llm-0", false, None);
        health.observe("llm-0", false, None);
        health.observe("llm-1", true, None);

        let balancer = LoadBalancer::new(breaker, health.clone());
        let candidates = backends(&[("llm-0", 1), ("llm-1", 1)]);

        for _ in 0..10 {
            let (backend, _guard) = balancer.select("llm", &candidates).unwrap();
            assert_eq!(backend.id, "llm-1");
        }

        // Once the backend recovers it rejoins the pool, picked first by LRU.
        health.observe("llm-0", true, None);
        let (backend, _guard) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(backend.id, "llm-0");
    }

    #[test]
    fn test_never_selects_open_circuit() {
        let (breaker, health) = components();
        health.observe("llm-0", true, None);
        health.observe("llm-1", true, None);
        for _ in 0..5 {
            breaker.report_outcome("llm-0", false, 5);
        }

        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1), ("llm-1", 1)]);

        for _ in 0..10 {
            let (backend, _guard) = balancer.select("llm", &candidates).unwrap();
            assert_eq!(backend.id, "llm-1");
        }
    }

    #[test]
    fn test_empty_filtered_set_errors() {
        let (breaker, health) = components();
        health.observe("llm-0", false, None);
        health.observe("llm-0", false, None);
        health.observe("llm-0", false, None);

        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1)]);

        let err = balancer.select("llm", &candidates).unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyBackend { .. }));
    }

    #[test]
    fn test_healthy_preferred_over_unknown() {
        let (breaker, health) = components();
        health.observe("llm-1", true, None);
        // llm-0 never observed.

        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1), ("llm-1", 1)]);

        for _ in 0..5 {
            let (backend, _guard) = balancer.select("llm", &candidates).unwrap();
            assert_eq!(backend.id, "llm-1");
        }
    }

    #[test]
    fn test_unknown_serves_when_nothing_healthy() {
        let (breaker, health) = components();
        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1)]);

        let (backend, _guard) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(backend.id, "llm-0");
    }

    #[test]
    fn test_least_loaded_wins() {
        let (breaker, health) = components();
        health.observe("llm-0", true, None);
        health.observe("llm-1", true, None);

        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1), ("llm-1", 1)]);

        // Hold two requests on llm-0.
        let (first, _g0) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(first.id, "llm-0");
        let (second, _g1) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(second.id, "llm-1");

        // Equal load again; LRU tie-break picks llm-0.
        let (third, _g2) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(third.id, "llm-0");

        // llm-0 now carries 2 in-flight vs 1 on llm-1.
        let (fourth, _g3) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(fourth.id, "llm-1");
    }

    #[test]
    fn test_weight_scales_effective_load() {
        let (breaker, health) = components();
        health.observe("llm-0", true, None);
        health.observe("llm-1", true, None);

        let balancer = LoadBalancer::new(breaker, health);
        // llm-1 can absorb three times the in-flight per unit of load.
        let candidates = backends(&[("llm-0", 1), ("llm-1", 3)]);

        let mut guards = Vec::new();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..8 {
            let (backend, guard) = balancer.select("llm", &candidates).unwrap();
            *counts.entry(backend.id.clone()).or_insert(0u32) += 1;
            guards.push(guard);
        }

        // 8 held requests settle at 2 on weight-1 and 6 on weight-3.
        assert_eq!(counts["llm-0"], 2);
        assert_eq!(counts["llm-1"], 6);
    }

    #[test]
    fn test_lru_alternates_idle_equal_backends() {
        let (breaker, health) = components();
        health.observe("llm-0", true, None);
        health.observe("llm-1", true, None);

        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1), ("llm-1", 1)]);

        let mut order = Vec::new();
        for _ in 0..4 {
            let (backend, guard) = balancer.select("llm", &candidates).unwrap();
            order.push(backend.id.clone());
            drop(guard);
        }
        assert_eq!(order, vec!["llm-0", "llm-1", "llm-0", "llm-1"]);
    }

    #[test]
    fn test_guard_releases_in_flight() {
        let (breaker, health) = components();
        let balancer = LoadBalancer::new(breaker, health);
        let candidates = backends(&[("llm-0", 1)]);

        assert_eq!(balancer.in_flight("llm-0"), 0);
        let (_, guard) = balancer.select("llm", &candidates).unwrap();
        assert_eq!(balancer.in_flight("llm-0"), 1);
        drop(guard);
        assert_eq!(balancer.in_flight("llm-0"), 0);
        assert_eq!(balancer.selections("llm-0"), 1);
    }
}
