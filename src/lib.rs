//! # Inference Gateway - Core Library Crate
//!
//! Admission control and request routing for a fleet of inference backends.
//! The library decides, for every incoming request, whether to admit it and
//! where to send it, then supervises the dispatch and records the outcome.
//!
//! ## Architecture Overview
//!
//! The gateway is built around a handful of cooperating components:
//! - `policy`: per-endpoint policies compiled into hot-swappable snapshots
//! - `admission`: fixed-window rate limiting keyed by caller subject
//! - `breaker`: per-backend circuit breakers with half-open trials
//! - `health`: active probing and passive outcome tracking per backend
//! - `discovery`: the registry of backends grouped by service class
//! - `balancer`: weighted least-loaded selection over eligible backends
//! - `pipeline`: the per-request sequence tying all of the above together
//! - `events`: the write-only outcome record emitted for every request
//!
//! The decision pipeline is transport-agnostic: it consumes a request
//! descriptor and returns either a backend response or a typed rejection.
//! The bundled HTTP server only exposes read-only introspection endpoints.

/// Core functionality including error types, configuration, and basic data
/// structures used throughout the gateway
pub mod core;

/// Per-endpoint admission policies, subject tiers, and the compiled policy
/// snapshot with hot reload
pub mod policy;

/// Fixed-window rate limiting: bucket storage, sweeping, and the admission
/// decision combining per-minute and per-second limits
pub mod admission;

/// Per-backend circuit breakers: closed/open/half-open lifecycle, cooldown
/// doubling, and trial claiming
pub mod breaker;

/// Backend health tracking: active HTTP probes and passive dispatch outcomes
/// feeding one shared update path
pub mod health;

/// Backend registry grouped by service class
pub mod discovery;

/// Load balancing across eligible backends: weighted least-loaded selection
/// with in-flight tracking
pub mod balancer;

/// The per-request decision pipeline: admission, selection, dispatch with
/// retries, outcome reporting
pub mod pipeline;

/// Request outcome events and the sinks that receive them
pub mod events;

/// Read-only admin and metrics endpoints
pub mod admin;

/// Introspection server implementation
pub mod gateway;

// Re-export commonly used types so embedders can reach the public API from
// the crate root.

/// Main error type and result alias used throughout the gateway
pub use crate::core::error::{GatewayError, GatewayResult};

/// Main configuration structure for the gateway
pub use crate::core::config::GatewayConfig;

/// Core data types crossing component boundaries
pub use crate::core::types::{
    Backend, Decision, GatewayResponse, HealthStatus, IncomingRequest, RequestOutcomeEvent,
    Subject, SubjectKind,
};

/// Policy surface: per-endpoint configuration and the live snapshot store
pub use policy::{EndpointPolicy, PolicySnapshot, PolicyStore, TierConfig};

/// Admission surface: the limiter and its bucket store
pub use admission::{AdmitDecision, BucketStore, RateLimiter};

/// Backend protection and selection components
pub use balancer::LoadBalancer;
pub use breaker::CircuitBreaker;
pub use discovery::BackendRegistry;
pub use health::HealthMonitor;

/// The pipeline and its dispatch seam
pub use pipeline::{BackendDispatcher, DecisionPipeline, HttpDispatcher};

/// Outcome reporting
pub use events::{OutcomeSink, TracingOutcomeSink};

/// Introspection server entry points
pub use gateway::server::{install_prometheus_recorder, GatewayServer};
