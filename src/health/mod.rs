//! Backend health monitoring.
//!
//! Every registered backend carries a health record updated through one path:
//! [`HealthMonitor::observe`]. The background prober feeds it with active
//! HTTP checks on a fixed interval; the decision pipeline feeds it passively
//! with real request outcomes, so a backend failing live traffic is marked
//! unhealthy without waiting for the next probe round.
//!
//! A single success heals; `unhealthy_threshold` consecutive failures mark
//! a backend unhealthy. Backends start `Unknown` until the first observation.

use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::HealthConfig;
use crate::core::types::{Backend, HealthStatus};
use crate::discovery::BackendRegistry;

#[derive(Debug, Clone)]
struct HealthRecord {
    status: HealthStatus,
    consecutive_failures: u32,
    last_check: Option<Instant>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    last_latency: Option<Duration>,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_check: None,
            last_success: None,
            last_failure: None,
            last_latency: None,
        }
    }
}

/// Serializable view of one backend's health for the introspection API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub backend: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check_secs_ago: Option<u64>,
    pub last_success_secs_ago: Option<u64>,
    pub last_failure_secs_ago: Option<u64>,
    pub last_latency_ms: Option<u64>,
}

/// Aggregate fleet health reported alongside the per-backend snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub overall: String,
}

/// Owns all health records and the probing schedule.
pub struct HealthMonitor {
    records: DashMap<String, HealthRecord>,
    settings: HealthConfig,
}

impl HealthMonitor {
    pub fn new(settings: HealthConfig) -> Self {
        Self {
            records: DashMap::new(),
            settings,
        }
    }

    /// Create the record for a backend (status `Unknown`).
    pub fn register(&self, backend: &str) {
        self.records
            .entry(backend.to_string())
            .or_insert_with(HealthRecord::new);
    }

    /// Record one observation, from a probe or from real traffic.
    pub fn observe(&self, backend: &str, success: bool, latency: Option<Duration>) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(backend.to_string())
            .or_insert_with(HealthRecord::new);

        record.last_check = Some(now);
        if latency.is_some() {
            record.last_latency = latency;
        }

        if success {
            record.consecutive_failures = 0;
            record.last_success = Some(now);
            if record.status != HealthStatus::Healthy {
                counter!("gateway_health_transitions_total", "status" => "healthy").increment(1);
                info!(backend, "Backend healthy");
            }
            record.status = HealthStatus::Healthy;
        } else {
            record.consecutive_failures += 1;
            record.last_failure = Some(now);
            if record.consecutive_failures >= self.settings.unhealthy_threshold
                && record.status != HealthStatus::Unhealthy
            {
                counter!("gateway_health_transitions_total", "status" => "unhealthy").increment(1);
                warn!(
                    backend,
                    failures = record.consecutive_failures,
                    "Backend unhealthy"
                );
                record.status = HealthStatus::Unhealthy;
            }
        }
    }

    /// Current status; `Unknown` for backends never observed.
    pub fn status(&self, backend: &str) -> HealthStatus {
        self.records
            .get(backend)
            .map(|record| record.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Snapshots of every record, sorted by backend id.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let now = Instant::now();
        let secs_ago = |at: Option<Instant>| {
            at.map(|at| now.saturating_duration_since(at).as_secs())
        };

        let mut snapshots: Vec<HealthSnapshot> = self
            .records
            .iter()
            .map(|entry| {
                let record = entry.value();
                HealthSnapshot {
                    backend: entry.key().clone(),
                    status: record.status,
                    consecutive_failures: record.consecutive_failures,
                    last_check_secs_ago: secs_ago(record.last_check),
                    last_success_secs_ago: secs_ago(record.last_success),
                    last_failure_secs_ago: secs_ago(record.last_failure),
                    last_latency_ms: record.last_latency.map(|d| d.as_millis() as u64),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.backend.cmp(&b.backend));
        snapshots
    }

    /// Aggregate counts across the fleet.
    pub fn fleet_summary(&self) -> FleetSummary {
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut unknown = 0;
        for entry in self.records.iter() {
            match entry.value().status {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Unknown => unknown += 1,
            }
        }
        let total = healthy + unhealthy + unknown;

        let overall = if total == 0 {
            "unknown"
        } else if unhealthy > 0 && healthy == 0 {
            "unhealthy"
        } else if unhealthy > 0 {
            "degraded"
        } else if healthy > 0 {
            "healthy"
        } else {
            "unknown"
        };

        FleetSummary {
            total,
            healthy,
            unhealthy,
            unknown,
            overall: overall.to_string(),
        }
    }

    /// Background task probing every registered backend on a fixed interval.
    ///
    /// Probes within one round run concurrently, each bounded by the
    /// configured probe timeout. Outcomes flow through [`observe`](Self::observe),
    /// the same path passive traffic reporting uses.
    pub fn spawn_prober(
        self: &Arc<Self>,
        registry: Arc<BackendRegistry>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut ticker = tokio::time::interval(monitor.settings.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;

                let backends = registry.all();
                let probes = backends
                    .iter()
                    .map(|backend| probe(&client, monitor.settings.probe_timeout, backend));
                let outcomes = join_all(probes).await;

                for (backend, (success, latency)) in backends.iter().zip(outcomes) {
                    monitor.observe(&backend.id, success, Some(latency));
                }

                let summary = monitor.fleet_summary();
                gauge!("gateway_healthy_backends").set(summary.healthy as f64);
                debug!(
                    healthy = summary.healthy,
                    total = summary.total,
                    "Health probe round complete"
                );
            }
        })
    }
}

/// One active probe: GET the backend's health endpoint with a bounded timeout.
async fn probe(
    client: &reqwest::Client,
    timeout: Duration,
    backend: &Backend,
) -> (bool, Duration) {
    let url = backend.health_url();
    let started = Instant::now();
    let success = match tokio::time::timeout(timeout, client.get(&url).send()).await {
        Ok(Ok(response)) => response.status().is_success(),
        Ok(Err(e)) => {
            debug!(backend = %backend.id, error = %e, "Health probe failed");
            false
        }
        Err(_) => {
            debug!(
                backend = %backend.id,
                timeout_ms = timeout.as_millis() as u64,
                "Health probe timed out"
            );
            false
        }
    };
    (success, started.elapsed())
}
