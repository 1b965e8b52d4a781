//! Backend registry.
//!
//! Holds the set of registered backend workers, grouped by service class.
//! Registration is config-driven at startup; the registry hands out shared
//! [`Backend`] handles so a deregistration never invalidates a backend an
//! in-flight request is using.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::core::config::GatewayConfig;
use crate::core::types::Backend;

pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
        }
    }

    /// Register every backend from the validated config.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let registry = Self::new();
        for backend in &config.backends {
            registry.register(backend.clone());
        }
        registry
    }

    pub fn register(&self, backend: Backend) -> Arc<Backend> {
        let backend = Arc::new(backend);
        info!(
            backend = %backend.id,
            service_class = %backend.service_class,
            url = %backend.base_url,
            weight = backend.weight,
            "Registered backend"
        );
        self.backends
            .insert(backend.id.clone(), Arc::clone(&backend));
        backend
    }

    pub fn deregister(&self, id: &str) -> Option<Arc<Backend>> {
        let removed = self.backends.remove(id).map(|(_, backend)| backend);
        if let Some(backend) = &removed {
            info!(backend = %backend.id, "Deregistered backend");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// All backends serving the given service class, ordered by id.
    pub fn candidates(&self, service_class: &str) -> Vec<Arc<Backend>> {
        let mut candidates: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .filter(|entry| entry.value().service_class == service_class)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Every registered backend, ordered by id.
    pub fn all(&self) -> Vec<Arc<Backend>> {
        let mut all: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Distinct service classes with at least one backend.
    pub fn service_classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self
            .backends
            .iter()
            .map(|entry| entry.value().service_class.clone())
            .collect();
        classes.sort();
        classes.dedup();
        classes
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
