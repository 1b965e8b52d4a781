//! # Inference Gateway - Main Entry Point
//!
//! Runs the gateway's decision components as a standalone process: the
//! backend registry, health prober, circuit breaker transitions, rate-limit
//! bucket sweeper, policy hot reload, and the read-only admin/metrics server.
//!
//! The transport layer that feeds requests into the decision pipeline is an
//! external collaborator; embedders construct a
//! [`inference_gateway::DecisionPipeline`] from the same components this
//! binary wires and call `execute` per request.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use inference_gateway::admin::AdminState;
use inference_gateway::admission::BucketStore;
use inference_gateway::breaker::CircuitBreaker;
use inference_gateway::core::config::ObservabilityConfig;
use inference_gateway::discovery::BackendRegistry;
use inference_gateway::gateway::server::{install_prometheus_recorder, GatewayServer};
use inference_gateway::health::HealthMonitor;
use inference_gateway::policy::{PolicySnapshot, PolicyStore};
use inference_gateway::{GatewayConfig, GatewayResult};

/// Cadence of the breaker open -> half-open transition scan
const BREAKER_TICK_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> GatewayResult<()> {
    // Configuration drives the logging setup, so it loads first; a failure
    // here surfaces through the process exit status.
    let config_path = std::env::var("GATEWAY_CONFIG_PATH")
        .unwrap_or_else(|_| "config/gateway.yaml".to_string());
    let config = GatewayConfig::load_from_file(&config_path).await?;

    init_observability(&config.observability);

    info!("🚀 Starting Inference Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path);

    match graceful_startup(config, config_path).await {
        Ok(server) => {
            graceful_shutdown(server).await?;
        }
        Err(e) => {
            error!("Failed to start gateway: {}", e);
            std::process::exit(1);
        }
    }

    info!("✅ Inference Gateway shutdown complete");
    Ok(())
}

/// Initialize logging per the observability configuration.
///
/// `RUST_LOG` takes precedence over the configured level when set.
fn init_observability(config: &ObservabilityConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("inference_gateway={},tower_http=info", config.logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

/// Wire the decision components, start the background tasks, and build the
/// admin server.
async fn graceful_startup(
    config: GatewayConfig,
    config_path: String,
) -> GatewayResult<GatewayServer> {
    info!("🔧 Starting graceful startup sequence...");

    // The recorder must be live before components record their first metric.
    let prometheus = if config.observability.metrics.prometheus_enabled {
        info!("📈 Prometheus metrics enabled");
        Some(install_prometheus_recorder()?)
    } else {
        warn!("Prometheus metrics disabled; /metrics will return 404");
        None
    };

    info!("📋 Compiling policy snapshot...");
    let snapshot = PolicySnapshot::from_config(&config)?;
    info!(
        policies = snapshot.policy_count(),
        tiers = snapshot.tier_count(),
        "✅ Policy snapshot compiled"
    );
    let policies = Arc::new(PolicyStore::new(snapshot));
    policies.watch_config_file(config_path.into())?;

    info!("🗂️  Registering backends...");
    let registry = Arc::new(BackendRegistry::from_config(&config));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    for backend in registry.all() {
        breaker.register(&backend.id);
        health.register(&backend.id);
    }
    info!(
        backends = registry.len(),
        classes = registry.service_classes().len(),
        "✅ Backend registry ready"
    );

    info!("🏥 Starting health prober...");
    health.spawn_prober(Arc::clone(&registry));

    info!("🧹 Starting bucket sweeper...");
    let buckets = Arc::new(BucketStore::new());
    buckets.spawn_sweeper(config.admission.sweep_interval);

    breaker.spawn_transition_task(BREAKER_TICK_INTERVAL);

    let state = AdminState {
        registry,
        health,
        breaker,
        policies,
        prometheus,
        started_at: Instant::now(),
    };
    let server = GatewayServer::new(&config, state)?;

    info!("⚙️  Admin interface ready on {}", server.bind_addr());
    info!("📊 Metrics available on {}/metrics", server.bind_addr());
    info!("🚀 Gateway startup completed successfully");

    Ok(server)
}

/// Serve until SIGTERM or SIGINT, then shut down.
async fn graceful_shutdown(server: GatewayServer) -> GatewayResult<()> {
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("Server error: {}", e);
        }
    });

    let shutdown_signal = async {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal => {
            info!("🛑 Shutting down...");
            server_handle.abort();
        }
        result = &mut server_handle => {
            match result {
                Ok(_) => info!("🏁 Server task completed"),
                Err(e) => error!("🚨 Server task failed: {}", e),
            }
        }
    }

    Ok(())
}
