//! # Configuration Module
//!
//! Loads the gateway configuration from YAML, applies `GATEWAY_*` environment
//! overrides, and validates the result with detailed error messages. The
//! admission-policy portion of the file is compiled into an immutable snapshot
//! by the policy store; hot reload lives there, not here.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Backend;
use crate::policy::{EndpointPolicy, TierConfig};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Introspection server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Statically registered backends
    #[serde(default)]
    pub backends: Vec<Backend>,

    /// Admission policies, one per (service, method, path pattern)
    #[serde(default)]
    pub policies: Vec<EndpointPolicy>,

    /// Subject tiers with limit multipliers
    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    /// Rate-limiter settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Health prober settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Circuit breaker timing settings (thresholds come from policies)
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Logging and metrics settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string, apply env overrides, validate
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let mut config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_ADMIN_PORT=9191
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(port) = env::var("GATEWAY_SERVER_ADMIN_PORT") {
            self.server.admin_port = port.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_SERVER_ADMIN_PORT: {}", e))
            })?;
        }

        if let Ok(interval) = env::var("GATEWAY_HEALTH_PROBE_INTERVAL") {
            self.health.probe_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_HEALTH_PROBE_INTERVAL: {}", e))
            })?;
        }

        if let Ok(timeout) = env::var("GATEWAY_HEALTH_PROBE_TIMEOUT") {
            self.health.probe_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_HEALTH_PROBE_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(interval) = env::var("GATEWAY_ADMISSION_SWEEP_INTERVAL") {
            self.admission.sweep_interval = humantime::parse_duration(&interval).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_ADMISSION_SWEEP_INTERVAL: {}", e))
            })?;
        }

        if let Ok(cooldown) = env::var("GATEWAY_BREAKER_COOLDOWN") {
            self.circuit_breaker.cooldown = humantime::parse_duration(&cooldown).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_BREAKER_COOLDOWN: {}", e))
            })?;
        }

        if let Ok(cooldown) = env::var("GATEWAY_BREAKER_MAX_COOLDOWN") {
            self.circuit_breaker.max_cooldown =
                humantime::parse_duration(&cooldown).map_err(|e| {
                    GatewayError::config(format!("Invalid GATEWAY_BREAKER_MAX_COOLDOWN: {}", e))
                })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format;
        }

        if let Ok(enabled) = env::var("GATEWAY_METRICS_ENABLED") {
            self.observability.metrics.prometheus_enabled = enabled.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_METRICS_ENABLED: {}", e))
            })?;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }

        if self.server.admin_port == 0 {
            errors.push("admin_port must be greater than 0".to_string());
        }

        // Validate backends
        let mut backend_ids = HashSet::new();
        let mut service_classes = HashSet::new();
        for backend in &self.backends {
            if backend.id.is_empty() {
                errors.push("Backend with empty id".to_string());
            } else if !backend_ids.insert(&backend.id) {
                errors.push(format!("Duplicate backend id: {}", backend.id));
            }

            if backend.service_class.is_empty() {
                errors.push(format!("Backend '{}' has empty service_class", backend.id));
            } else {
                service_classes.insert(backend.service_class.as_str());
            }

            if let Err(e) = Url::parse(&backend.base_url) {
                errors.push(format!(
                    "Backend '{}' has invalid base_url '{}': {}",
                    backend.id, backend.base_url, e
                ));
            }

            if !backend.health_path.starts_with('/') {
                errors.push(format!(
                    "Backend '{}' health_path must start with '/'",
                    backend.id
                ));
            }

            if backend.weight == 0 {
                errors.push(format!("Backend '{}' weight must be greater than 0", backend.id));
            }
        }

        // Validate policies
        let mut policy_keys = HashSet::new();
        for policy in &self.policies {
            if policy.path_pattern.is_empty() || !policy.path_pattern.starts_with('/') {
                errors.push(format!(
                    "Policy for service '{}' has invalid path_pattern '{}'",
                    policy.service_name, policy.path_pattern
                ));
            }

            match policy.method.to_uppercase().as_str() {
                "GET" | "POST" | "PUT" | "DELETE" | "PATCH" | "HEAD" | "OPTIONS" => {}
                _ => errors.push(format!(
                    "Policy '{}' has invalid HTTP method: {}",
                    policy.path_pattern, policy.method
                )),
            }

            if policy.service_name.is_empty() {
                errors.push(format!("Policy '{}' has empty service_name", policy.path_pattern));
            } else if !self.backends.is_empty()
                && !service_classes.contains(policy.service_name.as_str())
            {
                errors.push(format!(
                    "Policy '{}' references unknown service class '{}'",
                    policy.path_pattern, policy.service_name
                ));
            }

            if !policy_keys.insert(policy.id()) {
                errors.push(format!("Duplicate policy: {}", policy.id()));
            }

            if policy.rate_limit_rpm == Some(0) {
                errors.push(format!(
                    "Policy '{}' rate_limit_rpm must be greater than 0 when set",
                    policy.path_pattern
                ));
            }

            if policy.rate_limit_rps == Some(0) {
                errors.push(format!(
                    "Policy '{}' rate_limit_rps must be greater than 0 when set",
                    policy.path_pattern
                ));
            }

            if policy.timeout_seconds == 0 {
                errors.push(format!(
                    "Policy '{}' timeout_seconds must be greater than 0",
                    policy.path_pattern
                ));
            }

            if policy.circuit_breaker_threshold == 0 {
                errors.push(format!(
                    "Policy '{}' circuit_breaker_threshold must be greater than 0",
                    policy.path_pattern
                ));
            }
        }

        // Validate tiers
        let mut tier_names = HashSet::new();
        let mut tier_keys = HashSet::new();
        for tier in &self.tiers {
            if tier.name.is_empty() {
                errors.push("Tier with empty name".to_string());
            } else if !tier_names.insert(&tier.name) {
                errors.push(format!("Duplicate tier name: {}", tier.name));
            }

            if !(tier.limit_multiplier.is_finite() && tier.limit_multiplier > 0.0) {
                errors.push(format!(
                    "Tier '{}' limit_multiplier must be a positive number",
                    tier.name
                ));
            }

            for key in &tier.api_keys {
                if !tier_keys.insert(key) {
                    errors.push(format!("API key assigned to more than one tier: {}", key));
                }
            }
        }

        // Validate admission settings
        if self.admission.sweep_interval.as_secs() == 0 {
            errors.push("admission sweep_interval must be greater than 0".to_string());
        }

        for path in &self.admission.exempt_paths {
            if !path.starts_with('/') {
                errors.push(format!("Exempt path must start with '/': {}", path));
            }
        }

        // Validate health settings
        if self.health.probe_interval.as_secs() == 0 {
            errors.push("health probe_interval must be greater than 0".to_string());
        }

        if self.health.probe_timeout.as_millis() == 0 {
            errors.push("health probe_timeout must be greater than 0".to_string());
        }

        if self.health.unhealthy_threshold == 0 {
            errors.push("health unhealthy_threshold must be greater than 0".to_string());
        }

        // Validate circuit breaker settings
        if self.circuit_breaker.cooldown.as_millis() == 0 {
            errors.push("circuit_breaker cooldown must be greater than 0".to_string());
        }

        if self.circuit_breaker.max_cooldown < self.circuit_breaker.cooldown {
            errors.push("circuit_breaker max_cooldown must be >= cooldown".to_string());
        }

        if self.circuit_breaker.half_open_trials == 0 {
            errors.push("circuit_breaker half_open_trials must be greater than 0".to_string());
        }

        // Validate observability settings
        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!(
                "Invalid log level: {}",
                self.observability.logging.level
            )),
        }

        match self.observability.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!(
                "Invalid log format: {}",
                self.observability.logging.format
            )),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// Introspection server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,

    /// Port for the read-only admin/metrics server
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            admin_port: 9090,
        }
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// How often expired buckets are reclaimed
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Paths that bypass admission entirely (health/metrics style probes)
    pub exempt_paths: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            exempt_paths: vec!["/health".to_string(), "/metrics".to_string()],
        }
    }
}

/// Health prober settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between active probe rounds
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Per-probe request timeout
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Consecutive failures before a backend is marked unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// Circuit breaker timing settings shared by all backends.
/// The failure threshold is per-policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Initial open-state cooldown before a half-open trial
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Cap for the doubled cooldown after failed trials
    #[serde(with = "humantime_serde")]
    pub max_cooldown: Duration,

    /// Concurrent trial requests permitted while half-open
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            half_open_trials: 1,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter on the admin server
    pub prometheus_enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;
    use tokio::fs;

    fn sample_yaml() -> &'static str {
        r#"
server:
  bind_address: "127.0.0.1"
  admin_port: 9191

backends:
  - id: "llm-0"
    service_class: "llm"
    base_url: "http://10.0.0.5:8188"
    weight: 2
  - id: "llm-1"
    service_class: "llm"
    base_url: "http://10.0.0.6:8188"

policies:
  - service_name: "llm"
    method: "POST"
    path_pattern: "/api/generate"
    rate_limit_rpm: 60
    rate_limit_rps: 10
    timeout_seconds: 20
    retry_attempts: 2

tiers:
  - name: "premium"
    limit_multiplier: 5.0
    api_keys: ["key-premium-1"]

admission:
  sweep_interval: "30s"
  exempt_paths: ["/health", "/metrics"]

health:
  probe_interval: "5s"
  probe_timeout: "2s"
  unhealthy_threshold: 3

circuit_breaker:
  cooldown: "30s"
  max_cooldown: "300s"
  half_open_trials: 1

observability:
  logging:
    level: "debug"
    format: "text"
  metrics:
    prometheus_enabled: true
"#
    }

    #[test]
    fn test_default_config_validation() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_yaml() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: GatewayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.server.admin_port, deserialized.server.admin_port);
        assert_eq!(config.server.bind_address, deserialized.server.bind_address);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");
        fs::write(&config_path, sample_yaml()).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.admin_port, 9191);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 2);
        assert_eq!(config.backends[1].weight, 1);
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].rate_limit_rpm, Some(60));
        assert_eq!(config.policies[0].timeout_seconds, 20);
        assert_eq!(config.tiers[0].limit_multiplier, 5.0);
        assert_eq!(config.health.probe_interval, Duration::from_secs(5));
        assert_eq!(config.observability.logging.level, "debug");
    }

    #[test]
    fn test_environment_variable_overrides() {
        env::set_var("GATEWAY_SERVER_ADMIN_PORT", "9999");
        env::set_var("GATEWAY_SERVER_BIND_ADDRESS", "192.168.1.1");
        env::set_var("GATEWAY_HEALTH_PROBE_INTERVAL", "3s");
        env::set_var("GATEWAY_LOG_LEVEL", "debug");
        env::set_var("GATEWAY_METRICS_ENABLED", "false");

        let mut config = GatewayConfig::default();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.server.bind_address, "192.168.1.1");
        assert_eq!(config.health.probe_interval, Duration::from_secs(3));
        assert_eq!(config.observability.logging.level, "debug");
        assert!(!config.observability.metrics.prometheus_enabled);

        env::remove_var("GATEWAY_SERVER_ADMIN_PORT");
        env::remove_var("GATEWAY_SERVER_BIND_ADDRESS");
        env::remove_var("GATEWAY_HEALTH_PROBE_INTERVAL");
        env::remove_var("GATEWAY_LOG_LEVEL");
        env::remove_var("GATEWAY_METRICS_ENABLED");
    }

    #[test]
    fn test_invalid_environment_variables() {
        env::set_var("GATEWAY_SERVER_ADMIN_PORT", "invalid_port");

        let mut config = GatewayConfig::default();
        let result = config.apply_env_overrides();

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid GATEWAY_SERVER_ADMIN_PORT"));

        env::remove_var("GATEWAY_SERVER_ADMIN_PORT");
    }

    #[test]
    fn test_backend_validation() {
        let mut config = GatewayConfig::default();
        config.backends.push(Backend::new("llm-0", "llm", "not a url"));

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("invalid base_url"));

        config.backends[0].base_url = "http://10.0.0.5:8188".to_string();
        assert!(config.validate().is_ok());

        // Duplicate ids are rejected
        config.backends.push(Backend::new("llm-0", "llm", "http://10.0.0.6:8188"));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Duplicate backend id"));
    }

    #[test]
    fn test_policy_validation() {
        let mut config: GatewayConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        assert!(config.validate().is_ok());

        // Unknown service class is rejected
        config.policies[0].service_name = "embeddings".to_string();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown service class"));

        // Zero rate limit is rejected
        config.policies[0].service_name = "llm".to_string();
        config.policies[0].rate_limit_rpm = Some(0);
        assert!(config.validate().is_err());

        // Invalid method is rejected
        config.policies[0].rate_limit_rpm = Some(60);
        config.policies[0].method = "FETCH".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_validation() {
        let mut config: GatewayConfig = serde_yaml::from_str(sample_yaml()).unwrap();

        config.tiers.push(TierConfig {
            name: "basic".to_string(),
            limit_multiplier: 1.0,
            api_keys: vec!["key-premium-1".to_string()],
        });

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("more than one tier"));
    }

    #[test]
    fn test_breaker_settings_validation() {
        let mut config = GatewayConfig::default();
        config.circuit_breaker.max_cooldown = Duration::from_secs(1);
        assert!(config.validate().is_err());

        config.circuit_breaker.max_cooldown = Duration::from_secs(300);
        config.circuit_breaker.half_open_trials = 0;
        assert!(config.validate().is_err());
    }
}
