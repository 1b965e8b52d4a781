//! # Introspection Server
//!
//! Serves the read-only admin surface (health, metrics, component snapshots)
//! over axum. The decision pipeline itself is transport-agnostic; embedders
//! call [`crate::pipeline::DecisionPipeline::execute`] directly, and this
//! server exposes the operational state of the components behind it.

use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admin::{AdminRouter, AdminState};
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// Histogram buckets for the duration metrics, in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the Prometheus recorder and return the render handle.
///
/// Must run once at startup, before the first metric macro fires; metrics
/// recorded earlier are lost.
pub fn install_prometheus_recorder() -> GatewayResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::config(format!("Invalid histogram buckets: {}", e)))?
        .set_buckets_for_metric(
            Matcher::Full("gateway_selection_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::config(format!("Invalid histogram buckets: {}", e)))?
        .install_recorder()
        .map_err(|e| {
            GatewayError::internal(format!("Failed to install metrics recorder: {}", e))
        })
}

/// The admin/metrics HTTP server.
pub struct GatewayServer {
    app: Router,
    bind_addr: SocketAddr,
}

impl GatewayServer {
    /// Build the server from configuration and component handles
    pub fn new(config: &GatewayConfig, state: AdminState) -> GatewayResult<Self> {
        let bind_addr: SocketAddr = format!(
            "{}:{}",
            config.server.bind_address, config.server.admin_port
        )
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid admin bind address: {}", e)))?;

        let app = AdminRouter::create_router(state).layer(TraceLayer::new_for_http());

        Ok(Self { app, bind_addr })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Bind and serve until the task is cancelled or the listener fails
    pub async fn start(self) -> GatewayResult<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind admin server to {}: {}",
                self.bind_addr, e
            ))
        })?;

        info!("Admin server listening on {}", self.bind_addr);

        axum::serve(listener, self.app)
            .await
            .map_err(|e| GatewayError::internal(format!("Admin server error: {}", e)))?;

        Ok(())
    }
}
