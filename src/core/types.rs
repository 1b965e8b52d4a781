//! Core data types shared across the gateway.
//!
//! This module defines the foundational structures the decision components
//! exchange: backend identity, request descriptors, admission subjects, and
//! the decision/outcome surface handed to the transport layer. Mutable
//! runtime state (buckets, breaker states, health records) lives with the
//! component that owns it, not here.

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A registered backend worker.
///
/// Identity and static configuration only. Health status belongs to the
/// health monitor and circuit state to the breaker registry; neither is
/// stored on the registration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Unique backend identifier
    pub id: String,

    /// Service class this backend serves (e.g. "llm", "embeddings")
    pub service_class: String,

    /// Base URL for dispatching requests (validated at config load)
    pub base_url: String,

    /// Relative path probed for health checks
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Weight for load balancing; higher weight receives more traffic
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Free-form labels surfaced on the admin API
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_weight() -> u32 {
    1
}

impl Backend {
    /// Create a backend with defaults for weight and health path
    pub fn new(
        id: impl Into<String>,
        service_class: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            service_class: service_class.into(),
            base_url: base_url.into(),
            health_path: default_health_path(),
            weight: default_weight(),
            metadata: HashMap::new(),
        }
    }

    /// Full URL for the given request path
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Full URL of the health probe endpoint
    pub fn health_url(&self) -> String {
        self.url_for(&self.health_path)
    }
}

/// Health status of a backend as observed by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Backend is healthy and ready to receive traffic
    Healthy,
    /// Backend is unhealthy and should not receive traffic
    Unhealthy,
    /// No observation yet; eligible for traffic at lowest priority
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// What kind of caller a rate-limit subject identifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    ClientIp,
    ApiKey,
    Endpoint,
    Service,
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKind::ClientIp => write!(f, "client_ip"),
            SubjectKind::ApiKey => write!(f, "api_key"),
            SubjectKind::Endpoint => write!(f, "endpoint"),
            SubjectKind::Service => write!(f, "service"),
        }
    }
}

/// The caller identity a rate-limit bucket counts against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: String,
}

impl Subject {
    pub fn api_key(id: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::ApiKey,
            id: id.into(),
        }
    }

    pub fn client_ip(ip: impl Into<String>) -> Self {
        Self {
            kind: SubjectKind::ClientIp,
            id: ip.into(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// An inbound request as seen by the decision pipeline.
///
/// The transport layer constructs one of these per request; the pipeline
/// never touches the underlying connection.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and outcome events)
    pub id: String,

    /// HTTP method
    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body as bytes.
    /// Arc so cloning the descriptor does not copy large payloads.
    pub body: Arc<Vec<u8>>,

    /// Peer address, when the transport knows it
    pub remote_addr: Option<SocketAddr>,

    /// When the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new request descriptor with a generated ID
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Vec<u8>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            headers,
            body: Arc::new(body),
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get query parameters as a string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// API key presented by the caller, if any
    pub fn api_key(&self) -> Option<&str> {
        self.header("x-api-key").filter(|key| !key.is_empty())
    }

    /// Resolve the client address for rate limiting.
    ///
    /// Order: first entry of `x-forwarded-for`, then `x-real-ip`, then the
    /// peer address, then the literal "unknown".
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            let real_ip = real_ip.trim();
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
        match self.remote_addr {
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        }
    }

    /// The admission subject for this request: the API key when one is
    /// presented, otherwise the client address.
    pub fn subject(&self) -> Subject {
        match self.api_key() {
            Some(key) => Subject::api_key(key),
            None => Subject::client_ip(self.client_ip()),
        }
    }
}

/// Final decision category for a request, recorded on the outcome event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Admitted, dispatched, backend answered; status is the backend's own
    Success,
    /// Rejected by the rate limiter
    Throttled,
    /// Rejected because the chosen class had only open-circuit candidates
    CircuitOpen,
    /// Rejected because no candidate survived eligibility filtering
    NoHealthyBackend,
    /// Dispatched but the backend failed after all permitted attempts
    BackendError,
    /// Dispatched but no attempt completed within the policy timeout
    Timeout,
    /// Rejected because no policy covers the route (fail-closed)
    PolicyDenied,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Success => "success",
            Decision::Throttled => "throttled",
            Decision::CircuitOpen => "circuit_open",
            Decision::NoHealthyBackend => "no_healthy_backend",
            Decision::BackendError => "backend_error",
            Decision::Timeout => "timeout",
            Decision::PolicyDenied => "policy_denied",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Response from a single backend dispatch attempt
#[derive(Debug, Clone)]
pub struct BackendResponse {
    /// HTTP status the backend returned
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Arc<Vec<u8>>,

    /// Time the attempt took
    pub latency: Duration,
}

/// Successful pipeline result handed back to the transport layer
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status to relay (the backend's own status)
    pub status: StatusCode,

    /// Response headers from the backend
    pub headers: HeaderMap,

    /// Response body from the backend
    pub body: Arc<Vec<u8>>,

    /// Backend that served the request
    pub backend_id: String,

    /// Total time spent in the pipeline, including retries
    pub latency: Duration,

    /// Number of dispatch attempts made
    pub attempts: u32,
}

/// Per-request record emitted to the outcome sink.
///
/// Write-once: the core emits it exactly once per request and never reads
/// it back.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcomeEvent {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub subject: String,
    /// Backend that handled (or last failed) the request, if any was chosen
    pub backend_id: Option<String>,
    pub decision: Decision,
    /// HTTP status surfaced to the caller
    pub status: u16,
    pub latency_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
    pub emitted_at: chrono::DateTime<chrono::Utc>,
}
