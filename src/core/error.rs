//! Error types for the gateway decision core.
//!
//! Every refusal the pipeline can produce is a variant here, so the mapping
//! from an internal decision to an HTTP status lives in exactly one place:
//!
//! - `RateLimitExceeded` -> 429
//! - `CircuitOpen`, `NoHealthyBackend`, `PolicyDenied` -> 503
//! - `BackendError` -> 502
//! - `Timeout` -> 504
//! - everything else -> 500
//!
//! The classification helpers (`is_retryable`, `should_trigger_circuit_breaker`)
//! are what the pipeline consults when deciding whether to try another backend
//! and whether an outcome counts against a backend's breaker.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All error conditions the gateway core can surface.
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the given message.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Request denied because no admission policy matched its route.
    /// Missing policy is a deny, never a pass-through.
    #[error("Policy denied request: {reason}")]
    PolicyDenied { reason: String },

    /// Rate limiting errors when request limits are exceeded
    #[error("Rate limit exceeded for {subject}: {limit} requests per {window}")]
    RateLimitExceeded {
        subject: String,
        limit: u32,
        window: String,
        retry_after_secs: u64,
    },

    /// Circuit breaker is open, preventing requests to a failing backend
    #[error("Circuit breaker open for backend: {backend}")]
    CircuitOpen { backend: String },

    /// No backend in the service class survived eligibility filtering
    #[error("No healthy backend available for service class: {service_class}")]
    NoHealthyBackend { service_class: String },

    /// Upstream backend failed (connection refused, reset, 5xx response)
    #[error("Backend error from {backend}: {reason}")]
    BackendError { backend: String, reason: String },

    /// Dispatch exceeded the policy's request timeout
    #[error("Request to {backend} timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    /// Internal errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, network errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors when making upstream requests
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a policy denial with a custom reason
    pub fn policy_denied<S: Into<String>>(reason: S) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Create a circuit-open error for the given backend
    pub fn circuit_open<S: Into<String>>(backend: S) -> Self {
        Self::CircuitOpen {
            backend: backend.into(),
        }
    }

    /// Create a no-healthy-backend error for the given service class
    pub fn no_healthy_backend<S: Into<String>>(service_class: S) -> Self {
        Self::NoHealthyBackend {
            service_class: service_class.into(),
        }
    }

    /// Create a backend error with a custom reason
    pub fn backend_error<S: Into<String>>(backend: S, reason: S) -> Self {
        Self::BackendError {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NoHealthyBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PolicyDenied { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendError { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if a request that failed with this error may be retried against
    /// another backend.
    ///
    /// Only transient upstream conditions qualify. Admission refusals
    /// (rate limit, policy) and terminal selection failures are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendError { .. } | Self::Timeout { .. } | Self::HttpClient { .. }
        )
    }

    /// Check if this error counts as a failure against the backend's
    /// circuit breaker.
    ///
    /// Refusals we produced ourselves (open circuit, rate limit) must not
    /// feed back into breaker state.
    pub fn should_trigger_circuit_breaker(&self) -> bool {
        matches!(
            self,
            Self::BackendError { .. } | Self::Timeout { .. } | Self::HttpClient { .. }
        )
    }

    /// Get a string representation of the error type for API responses
    /// and outcome events
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::BackendError { .. } => "backend_error",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }
}

/// Implement conversion from Infallible for middleware compatibility
impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Convert errors into structured HTTP responses.
///
/// Rate-limit refusals additionally carry a `Retry-After` header so clients
/// can back off without parsing the body.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        let mut response = (status, Json(error_response)).into_response();

        if let Self::RateLimitExceeded {
            retry_after_secs, ..
        } = self
        {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
