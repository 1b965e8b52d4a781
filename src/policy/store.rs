//! Compiled policy snapshots and hot reload.
//!
//! Policies are compiled once into a [`PolicySnapshot`] (one radix router per
//! HTTP method, plus tier and exemption lookups). The [`PolicyStore`] holds
//! the current snapshot behind an `RwLock<Arc<..>>`; in-flight requests keep
//! the `Arc` they resolved against, so a reload swaps the snapshot without
//! ever mutating a policy a request is using.

use axum::http::Method;
use chrono::{DateTime, Utc};
use matchit::Router as RadixRouter;
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Subject, SubjectKind};
use crate::policy::{EndpointPolicy, TierConfig};

/// Immutable compiled view of the policy configuration.
pub struct PolicySnapshot {
    /// One radix router per HTTP method; the same path pattern may appear
    /// under several methods with different policies.
    routers: HashMap<Method, RadixRouter<Arc<EndpointPolicy>>>,

    /// Paths that bypass admission entirely (exact match)
    exempt_paths: HashSet<String>,

    /// API key -> tier membership
    tier_by_key: HashMap<String, Arc<TierConfig>>,

    policy_count: usize,
    tier_count: usize,
    loaded_at: DateTime<Utc>,
}

impl PolicySnapshot {
    /// Compile policies, tiers, and exemptions into a snapshot.
    ///
    /// Fails on an invalid method or conflicting path patterns; a snapshot
    /// that compiles is safe to match against for its whole lifetime.
    pub fn compile(
        policies: &[EndpointPolicy],
        tiers: &[TierConfig],
        exempt_paths: &[String],
    ) -> GatewayResult<Self> {
        let mut routers: HashMap<Method, RadixRouter<Arc<EndpointPolicy>>> = HashMap::new();

        for policy in policies {
            let method = Method::from_str(&policy.method.to_uppercase()).map_err(|_| {
                GatewayError::config(format!(
                    "Policy '{}' has invalid HTTP method: {}",
                    policy.path_pattern, policy.method
                ))
            })?;

            routers
                .entry(method)
                .or_default()
                .insert(&policy.path_pattern, Arc::new(policy.clone()))
                .map_err(|e| {
                    GatewayError::config(format!(
                        "Failed to compile policy pattern '{}': {}",
                        policy.path_pattern, e
                    ))
                })?;
        }

        let mut tier_by_key = HashMap::new();
        for tier in tiers {
            let tier = Arc::new(tier.clone());
            for key in &tier.api_keys {
                tier_by_key.insert(key.clone(), Arc::clone(&tier));
            }
        }

        Ok(Self {
            routers,
            exempt_paths: exempt_paths.iter().cloned().collect(),
            tier_by_key,
            policy_count: policies.len(),
            tier_count: tiers.len(),
            loaded_at: Utc::now(),
        })
    }

    /// Compile a snapshot from the policy portion of the gateway config
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        Self::compile(&config.policies, &config.tiers, &config.admission.exempt_paths)
    }

    /// Resolve the policy covering a method + path, if any
    pub fn resolve(&self, method: &Method, path: &str) -> Option<Arc<EndpointPolicy>> {
        let router = self.routers.get(method)?;
        router.at(path).ok().map(|m| Arc::clone(m.value))
    }

    /// Whether the path bypasses admission entirely
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.contains(path)
    }

    /// Tier the subject belongs to, if any (API-key subjects only)
    pub fn tier_for(&self, subject: &Subject) -> Option<Arc<TierConfig>> {
        if subject.kind != SubjectKind::ApiKey {
            return None;
        }
        self.tier_by_key.get(&subject.id).cloned()
    }

    /// Limit multiplier for the subject; 1.0 when it belongs to no tier
    pub fn limit_multiplier(&self, subject: &Subject) -> f64 {
        self.tier_for(subject)
            .map(|tier| tier.limit_multiplier)
            .unwrap_or(1.0)
    }

    pub fn policy_count(&self) -> usize {
        self.policy_count
    }

    pub fn tier_count(&self) -> usize {
        self.tier_count
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Exempt paths, sorted for stable introspection output
    pub fn exempt_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.exempt_paths.iter().cloned().collect();
        paths.sort();
        paths
    }
}

/// Notification sent to subscribers when the snapshot is swapped
#[derive(Debug, Clone)]
pub struct PolicyReloadEvent {
    pub policy_count: usize,
    pub tier_count: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Holds the current policy snapshot and swaps it atomically on reload.
pub struct PolicyStore {
    snapshot: RwLock<Arc<PolicySnapshot>>,
    reload_tx: broadcast::Sender<PolicyReloadEvent>,

    /// Keeps the file watcher alive for the store's lifetime
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl PolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        let (reload_tx, _) = broadcast::channel(16);
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            reload_tx,
            watcher: Mutex::new(None),
        }
    }

    /// Build a store from a validated gateway config
    pub fn from_config(config: &GatewayConfig) -> GatewayResult<Self> {
        Ok(Self::new(PolicySnapshot::from_config(config)?))
    }

    /// The current snapshot. Callers hold the returned `Arc` for the
    /// duration of one request so a concurrent swap never changes the
    /// policies they observe.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Swap in a new snapshot and notify subscribers
    pub fn swap(&self, snapshot: PolicySnapshot) {
        let event = PolicyReloadEvent {
            policy_count: snapshot.policy_count,
            tier_count: snapshot.tier_count,
            loaded_at: snapshot.loaded_at,
        };

        {
            let mut guard = self.snapshot.write();
            *guard = Arc::new(snapshot);
        }

        metrics::gauge!("gateway_policies_loaded").set(event.policy_count as f64);
        let _ = self.reload_tx.send(event);
    }

    /// Subscribe to snapshot swaps
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyReloadEvent> {
        self.reload_tx.subscribe()
    }

    /// Reload the config file and swap the policy snapshot.
    ///
    /// Only the policy portion (policies, tiers, exemptions) takes effect;
    /// server and backend changes require a restart.
    pub async fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> GatewayResult<()> {
        let config = GatewayConfig::load_from_file(path).await?;
        let snapshot = PolicySnapshot::from_config(&config)?;
        let count = snapshot.policy_count;
        self.swap(snapshot);
        info!(policies = count, "Policy snapshot swapped");
        Ok(())
    }

    /// Watch the config file and reload the policy snapshot on change.
    ///
    /// Watches the parent directory rather than the file itself: editors
    /// that write-and-rename would otherwise detach a file-level watch.
    pub fn watch_config_file(self: &Arc<Self>, config_path: PathBuf) -> GatewayResult<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| GatewayError::config(format!("Failed to create file watcher: {}", e)))?;

        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| GatewayError::config(format!("Failed to watch config directory: {}", e)))?;

        *self.watcher.lock() = Some(watcher);

        let config_file_name = config_path
            .file_name()
            .ok_or_else(|| GatewayError::config("Invalid config file path"))?
            .to_owned();

        let store = Arc::clone(self);
        let task_config_path = config_path.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let is_config_file_event = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(&config_file_name));
                if !is_config_file_event {
                    continue;
                }

                match event.kind {
                    EventKind::Modify(_) | EventKind::Create(_) => {
                        info!("Policy configuration changed, reloading...");

                        // Give the editor time to finish writing the file.
                        tokio::time::sleep(Duration::from_millis(100)).await;

                        match store.reload_from_file(&task_config_path).await {
                            Ok(()) => {}
                            Err(e) => {
                                // Keep serving the previous snapshot.
                                error!(error = %e, "Policy reload failed");
                            }
                        }
                    }
                    _ => {}
                }
            }
            warn!("Policy file watcher channel closed");
        });

        info!(path = %config_path.display(), "Watching policy configuration for changes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(service: &str, method: &str, pattern: &str) -> EndpointPolicy {
        EndpointPolicy {
            service_name: service.to_string(),
            method: method.to_string(),
            path_pattern: pattern.to_string(),
            rate_limit_rpm: Some(60),
            rate_limit_rps: None,
            auth_required: false,
            timeout_seconds: 30,
            retry_attempts: 3,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: 5,
        }
    }

    #[test]
    fn test_resolve_by_method_and_pattern() {
        let policies = vec![
            policy("llm", "POST", "/api/generate"),
            policy("llm", "GET", "/api/models/{id}"),
            policy("registry", "GET", "/api/generate"),
        ];
        let snapshot = PolicySnapshot::compile(&policies, &[], &[]).unwrap();

        let hit = snapshot.resolve(&Method::POST, "/api/generate").unwrap();
        assert_eq!(hit.service_name, "llm");

        // Same path under a different method resolves the other policy.
        let hit = snapshot.resolve(&Method::GET, "/api/generate").unwrap();
        assert_eq!(hit.service_name, "registry");

        let hit = snapshot.resolve(&Method::GET, "/api/models/mistral-7b").unwrap();
        assert_eq!(hit.path_pattern, "/api/models/{id}");

        assert!(snapshot.resolve(&Method::DELETE, "/api/generate").is_none());
        assert!(snapshot.resolve(&Method::POST, "/api/unknown").is_none());
    }

    #[test]
    fn test_conflicting_patterns_fail_compile() {
        let policies = vec![
            policy("llm", "POST", "/api/generate"),
            policy("other", "POST", "/api/generate"),
        ];
        let result = PolicySnapshot::compile(&policies, &[], &[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_exempt_paths() {
        let snapshot = PolicySnapshot::compile(
            &[],
            &[],
            &["/health".to_string(), "/metrics".to_string()],
        )
        .unwrap();

        assert!(snapshot.is_exempt("/health"));
        assert!(snapshot.is_exempt("/metrics"));
        assert!(!snapshot.is_exempt("/api/generate"));
    }

    #[test]
    fn test_tier_multiplier() {
        let tiers = vec![TierConfig {
            name: "premium".to_string(),
            limit_multiplier: 5.0,
            api_keys: vec!["key-a".to_string()],
        }];
        let snapshot = PolicySnapshot::compile(&[], &tiers, &[]).unwrap();

        assert_eq!(snapshot.limit_multiplier(&Subject::api_key("key-a")), 5.0);
        assert_eq!(snapshot.limit_multiplier(&Subject::api_key("key-b")), 1.0);
        // Tiers never apply to address-based subjects.
        assert_eq!(snapshot.limit_multiplier(&Subject::client_ip("10.0.0.1")), 1.0);
    }

    #[tokio::test]
    async fn test_swap_notifies_subscribers() {
        let store = PolicyStore::new(PolicySnapshot::compile(&[], &[], &[]).unwrap());
        let mut rx = store.subscribe();
        assert_eq!(store.current().policy_count(), 0);

        let next = PolicySnapshot::compile(&[policy("llm", "POST", "/api/generate")], &[], &[])
            .unwrap();
        store.swap(next);

        assert_eq!(store.current().policy_count(), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.policy_count, 1);
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gateway.yaml");

        tokio::fs::write(
            &path,
            r#"
backends:
  - id: "llm-0"
    service_class: "llm"
    base_url: "http://127.0.0.1:9001"
policies:
  - service_name: "llm"
    method: "POST"
    path_pattern: "/api/generate"
    rate_limit_rpm: 60
"#,
        )
        .await
        .unwrap();

        let config = GatewayConfig::load_from_file(&path).await.unwrap();
        let store = PolicyStore::from_config(&config).unwrap();
        assert_eq!(store.current().policy_count(), 1);

        tokio::fs::write(
            &path,
            r#"
backends:
  - id: "llm-0"
    service_class: "llm"
    base_url: "http://127.0.0.1:9001"
policies:
  - service_name: "llm"
    method: "POST"
    path_pattern: "/api/generate"
    rate_limit_rpm: 120
  - service_name: "llm"
    method: "GET"
    path_pattern: "/api/models/{id}"
"#,
        )
        .await
        .unwrap();

        store.reload_from_file(&path).await.unwrap();
        let snapshot = store.current();
        assert_eq!(snapshot.policy_count(), 2);
        assert_eq!(
            snapshot
                .resolve(&Method::POST, "/api/generate")
                .unwrap()
                .rate_limit_rpm,
            Some(120)
        );
    }
}
