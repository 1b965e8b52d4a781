//! # Admission Policies
//!
//! An [`EndpointPolicy`] is the static per-route configuration the pipeline
//! consults for every request: rate limits, dispatch timeout, retry budget,
//! and circuit breaker settings. Policies are declared in the gateway config,
//! compiled into an immutable [`store::PolicySnapshot`] at load time, and
//! replaced wholesale on reload — never mutated while in use.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod store;

pub use store::{PolicyReloadEvent, PolicySnapshot, PolicyStore};

/// Per-endpoint admission and dispatch policy.
///
/// One policy covers one (service, method, path pattern) triple. A request
/// whose route resolves no policy is denied, never passed through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Service class the route dispatches to
    pub service_name: String,

    /// HTTP method this policy covers
    pub method: String,

    /// Path pattern, radix-tree syntax (e.g. "/api/models/{id}")
    pub path_pattern: String,

    /// Requests per minute per subject; absent disables the per-minute bucket
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Requests per second per subject (burst bucket); absent disables it
    #[serde(default)]
    pub rate_limit_rps: Option<u32>,

    /// Whether the transport layer must authenticate callers on this route.
    /// Enforcement happens outside the decision core; carried for operators.
    #[serde(default)]
    pub auth_required: bool,

    /// Dispatch timeout per attempt, in seconds
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Additional dispatch attempts permitted after a transient failure
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Whether outcomes on this route count against backend breakers
    #[serde(default = "default_circuit_breaker_enabled")]
    pub circuit_breaker_enabled: bool,

    /// Consecutive failures before a backend's breaker opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_circuit_breaker_enabled() -> bool {
    true
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

impl EndpointPolicy {
    /// Stable identifier used to key rate-limit buckets.
    ///
    /// Deterministic across reloads so an unchanged policy keeps counting
    /// in its existing windows.
    pub fn id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.service_name,
            self.method.to_uppercase(),
            self.path_pattern
        )
    }

    /// Dispatch timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// A named subject tier scaling policy limits for its members.
///
/// API keys listed under a tier get `limit_multiplier` applied to both the
/// per-minute and per-second limits. Subjects in no tier use multiplier 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name (for logs and the admin API)
    pub name: String,

    /// Factor applied to policy limits for members of this tier
    #[serde(default = "default_limit_multiplier")]
    pub limit_multiplier: f64,

    /// API keys belonging to this tier
    #[serde(default)]
    pub api_keys: Vec<String>,
}

fn default_limit_multiplier() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let yaml = r#"
service_name: "llm"
method: "POST"
path_pattern: "/api/generate"
"#;
        let policy: EndpointPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.rate_limit_rpm, None);
        assert_eq!(policy.rate_limit_rps, None);
        assert!(!policy.auth_required);
        assert_eq!(policy.timeout_seconds, 30);
        assert_eq!(policy.retry_attempts, 3);
        assert!(policy.circuit_breaker_enabled);
        assert_eq!(policy.circuit_breaker_threshold, 5);
    }

    #[test]
    fn test_policy_id_is_stable() {
        let yaml = r#"
service_name: "llm"
method: "post"
path_pattern: "/api/generate"
"#;
        let policy: EndpointPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.id(), "llm:POST:/api/generate");
        assert_eq!(policy.timeout(), Duration::from_secs(30));
    }
}
