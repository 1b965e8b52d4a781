//! # Admin Module
//!
//! Read-only introspection endpoints served on the admin port:
//! - `GET /health` for the gateway's own liveness plus a fleet summary
//! - `GET /metrics` for the Prometheus exposition
//! - `GET /admin/backends` for the registered backend set
//! - `GET /admin/backend-health` for per-backend health snapshots
//! - `GET /admin/circuit-breakers` for per-backend breaker snapshots
//! - `GET /admin/policies` for the loaded policy snapshot summary
//!
//! Every handler reads a point-in-time snapshot from the live components.
//! Nothing here mutates gateway state; state changes go through the config
//! file and hot reload.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::core::types::Backend;
use crate::discovery::BackendRegistry;
use crate::health::{FleetSummary, HealthMonitor, HealthSnapshot};
use crate::policy::PolicyStore;

/// Shared state for the introspection handlers
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<BackendRegistry>,
    pub health: Arc<HealthMonitor>,
    pub breaker: Arc<CircuitBreaker>,
    pub policies: Arc<PolicyStore>,

    /// Prometheus render handle; absent when the exporter is disabled
    pub prometheus: Option<PrometheusHandle>,

    /// Process start, for the uptime figure on `/health`
    pub started_at: Instant,
}

/// Admin router over the introspection handlers
pub struct AdminRouter;

impl AdminRouter {
    pub fn create_router(state: AdminState) -> Router {
        Router::new()
            .route("/health", get(gateway_health))
            .route("/metrics", get(render_metrics))
            .route("/admin/backends", get(list_backends))
            .route("/admin/backend-health", get(backend_health))
            .route("/admin/circuit-breakers", get(list_circuit_breakers))
            .route("/admin/policies", get(policy_summary))
            .with_state(state)
    }
}

/// Liveness response for the gateway process itself
#[derive(Debug, Serialize)]
pub struct GatewayHealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub fleet: FleetSummary,
}

/// Response for the registered backend listing
#[derive(Debug, Serialize)]
pub struct BackendListResponse {
    pub backends: Vec<Backend>,
    pub total: usize,
    pub service_classes: Vec<String>,
}

/// Response combining per-backend health with the fleet aggregate
#[derive(Debug, Serialize)]
pub struct BackendHealthResponse {
    pub summary: FleetSummary,
    pub backends: Vec<HealthSnapshot>,
}

/// Response for the breaker listing
#[derive(Debug, Serialize)]
pub struct CircuitBreakerListResponse {
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub total: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Summary of the currently loaded policy snapshot
#[derive(Debug, Serialize)]
pub struct PolicySummaryResponse {
    pub policy_count: usize,
    pub tier_count: usize,
    pub exempt_paths: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

async fn gateway_health(State(state): State<AdminState>) -> Json<GatewayHealthResponse> {
    Json(GatewayHealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        fleet: state.health.fleet_summary(),
    })
}

async fn render_metrics(State(state): State<AdminState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_backends(State(state): State<AdminState>) -> Json<BackendListResponse> {
    let backends: Vec<Backend> = state
        .registry
        .all()
        .iter()
        .map(|b| b.as_ref().clone())
        .collect();
    Json(BackendListResponse {
        total: backends.len(),
        service_classes: state.registry.service_classes(),
        backends,
    })
}

async fn backend_health(State(state): State<AdminState>) -> Json<BackendHealthResponse> {
    Json(BackendHealthResponse {
        summary: state.health.fleet_summary(),
        backends: state.health.snapshots(),
    })
}

async fn list_circuit_breakers(
    State(state): State<AdminState>,
) -> Json<CircuitBreakerListResponse> {
    let circuit_breakers = state.breaker.snapshots();
    let open = circuit_breakers.iter().filter(|s| s.state == "open").count();
    let half_open = circuit_breakers
        .iter()
        .filter(|s| s.state == "half_open")
        .count();
    Json(CircuitBreakerListResponse {
        total: circuit_breakers.len(),
        open,
        half_open,
        circuit_breakers,
    })
}

async fn policy_summary(State(state): State<AdminState>) -> Json<PolicySummaryResponse> {
    let snapshot = state.policies.current();
    Json(PolicySummaryResponse {
        policy_count: snapshot.policy_count(),
        tier_count: snapshot.tier_count(),
        exempt_paths: snapshot.exempt_paths(),
        loaded_at: snapshot.loaded_at(),
    })
}
