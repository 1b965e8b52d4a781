//! The per-request decision pipeline.
//!
//! `execute` runs the full sequence for one request: resolve the policy
//! (fail-closed when none matches), check admission, select a backend through
//! the circuit- and health-aware balancer, dispatch with a bounded timeout,
//! report the outcome to the breaker and health monitor, and emit exactly one
//! [`RequestOutcomeEvent`].
//!
//! Retries stay inside the policy budget and only follow transient failures
//! and timeouts, never admission or eligibility rejections. Each retry makes
//! a fresh selection that prefers backends not yet tried this request.
//! Outcome reporting happens synchronously after every attempt, so a retry's
//! selection always observes the failure that preceded it; event emission is
//! detached so a disappearing caller cannot lose the record.

pub mod dispatcher;

pub use dispatcher::{BackendDispatcher, HttpDispatcher};

use chrono::Utc;
use metrics::{counter, histogram};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::admission::RateLimiter;
use crate::balancer::LoadBalancer;
use crate::breaker::CircuitBreaker;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    Backend, BackendResponse, Decision, GatewayResponse, IncomingRequest, RequestOutcomeEvent,
    Subject,
};
use crate::discovery::BackendRegistry;
use crate::events::OutcomeSink;
use crate::health::HealthMonitor;
use crate::policy::{EndpointPolicy, PolicyStore};

/// Failure leaving `dispatch_with_retries`, with what was learned on the way.
struct DispatchFailure {
    error: GatewayError,
    backend_id: Option<String>,
    attempts: u32,
}

pub struct DecisionPipeline {
    policies: Arc<PolicyStore>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    registry: Arc<BackendRegistry>,
    balancer: Arc<LoadBalancer>,
    dispatcher: Arc<dyn BackendDispatcher>,
    sink: Arc<dyn OutcomeSink>,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<PolicyStore>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        registry: Arc<BackendRegistry>,
        balancer: Arc<LoadBalancer>,
        dispatcher: Arc<dyn BackendDispatcher>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            policies,
            limiter,
            breaker,
            health,
            registry,
            balancer,
            dispatcher,
            sink,
        }
    }

    /// Run the full decision sequence for one request.
    pub async fn execute(&self, request: IncomingRequest) -> GatewayResult<GatewayResponse> {
        let snapshot = self.policies.current();
        let subject = request.subject();

        let Some(policy) = snapshot.resolve(&request.method, request.path()) else {
            let error = GatewayError::policy_denied(format!(
                "No policy covers {} {}",
                request.method,
                request.path()
            ));
            return Err(self.reject(&request, &subject, None, 0, error));
        };

        // Exempt paths skip admission; routing still requires a policy.
        if !snapshot.is_exempt(request.path()) {
            let multiplier = snapshot.limit_multiplier(&subject);
            let admit = self.limiter.admit(&subject, &policy, multiplier);
            if !admit.allowed {
                return Err(self.reject(&request, &subject, None, 0, admit.to_error(&subject)));
            }
        }

        let candidates = self.registry.candidates(&policy.service_name);
        match self.dispatch_with_retries(&request, &policy, &candidates).await {
            Ok((response, backend_id, attempts)) => {
                let gateway_response = GatewayResponse {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    backend_id: backend_id.clone(),
                    latency: request.received_at.elapsed(),
                    attempts,
                };
                self.emit(
                    &request,
                    &subject,
                    Decision::Success,
                    Some(backend_id),
                    gateway_response.status.as_u16(),
                    attempts,
                    None,
                );
                Ok(gateway_response)
            }
            Err(failure) => Err(self.reject(
                &request,
                &subject,
                failure.backend_id,
                failure.attempts,
                failure.error,
            )),
        }
    }

    /// Select, dispatch, and report until success, a non-retryable failure,
    /// or the retry budget runs out.
    async fn dispatch_with_retries(
        &self,
        request: &IncomingRequest,
        policy: &EndpointPolicy,
        candidates: &[Arc<Backend>],
    ) -> Result<(BackendResponse, String, u32), DispatchFailure> {
        let max_attempts = policy.retry_attempts.saturating_add(1);
        let mut tried: Vec<String> = Vec::new();
        let mut claim_failed: HashSet<String> = HashSet::new();
        let mut attempts: u32 = 0;
        let mut last_backend: Option<String> = None;
        let mut last_error: Option<GatewayError> = None;

        while attempts < max_attempts {
            // Prefer backends not yet tried this request; once every
            // candidate has been tried, remaining budget may revisit them.
            // Backends that refused a breaker claim stay excluded.
            let untried: Vec<Arc<Backend>> = candidates
                .iter()
                .filter(|b| !claim_failed.contains(&b.id) && !tried.contains(&b.id))
                .cloned()
                .collect();
            let pool: Vec<Arc<Backend>> = if untried.is_empty() {
                candidates
                    .iter()
                    .filter(|b| !claim_failed.contains(&b.id))
                    .cloned()
                    .collect()
            } else {
                untried
            };

            let (backend, guard) = match self.balancer.select(&policy.service_name, &pool) {
                Ok(selected) => selected,
                Err(error) => {
                    // An empty eligible set is surfaced, never retried. A
                    // dispatch failure seen earlier is the more useful error.
                    return Err(DispatchFailure {
                        error: last_error.unwrap_or(error),
                        backend_id: last_backend,
                        attempts,
                    });
                }
            };

            if policy.circuit_breaker_enabled && !self.breaker.allow(&backend.id) {
                // Lost the trial-claim race between eligibility filtering
                // and dispatch; pick somewhere else.
                drop(guard);
                debug!(backend = %backend.id, "Breaker refused claim after selection");
                claim_failed.insert(backend.id.clone());
                if last_error.is_none() {
                    last_error = Some(GatewayError::circuit_open(backend.id.clone()));
                    last_backend = Some(backend.id.clone());
                }
                continue;
            }

            attempts += 1;
            if !tried.contains(&backend.id) {
                tried.push(backend.id.clone());
            }
            last_backend = Some(backend.id.clone());

            let (outcome, latency) = self.attempt(request, policy, &backend).await;
            drop(guard);

            match outcome {
                Ok(response) => {
                    self.report(&backend.id, true, latency, policy);
                    return Ok((response, backend.id.clone(), attempts));
                }
                Err(error) => {
                    self.report(&backend.id, false, latency, policy);
                    counter!("gateway_dispatch_failures_total", "error" => error.error_type())
                        .increment(1);
                    warn!(
                        request_id = %request.id,
                        backend = %backend.id,
                        attempt = attempts,
                        error = %error,
                        "Dispatch attempt failed"
                    );

                    if !error.is_retryable() || attempts >= max_attempts {
                        return Err(DispatchFailure {
                            error,
                            backend_id: Some(backend.id.clone()),
                            attempts,
                        });
                    }
                    counter!("gateway_retries_total").increment(1);
                    last_error = Some(error);
                    self.backoff(attempts).await;
                }
            }
        }

        // Reachable only when every iteration lost a claim race.
        Err(DispatchFailure {
            error: last_error
                .unwrap_or_else(|| GatewayError::no_healthy_backend(&policy.service_name)),
            backend_id: last_backend,
            attempts,
        })
    }

    /// One dispatch attempt, bounded by the policy timeout. A 5xx response
    /// counts as a failure so it feeds the breaker and may be retried.
    async fn attempt(
        &self,
        request: &IncomingRequest,
        policy: &EndpointPolicy,
        backend: &Arc<Backend>,
    ) -> (GatewayResult<BackendResponse>, Duration) {
        let timeout = policy.timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(
            timeout,
            self.dispatcher.dispatch(backend, request),
        )
        .await
        {
            Ok(Ok(response)) if response.status.is_server_error() => {
                Err(GatewayError::backend_error(
                    backend.id.clone(),
                    format!("HTTP {}", response.status.as_u16()),
                ))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(GatewayError::Timeout {
                backend: backend.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        (result, started.elapsed())
    }

    /// Feed one attempt's outcome to the breaker and the health monitor.
    ///
    /// Runs before the next selection, so retries observe the state this
    /// outcome produced.
    fn report(&self, backend: &str, success: bool, latency: Duration, policy: &EndpointPolicy) {
        if policy.circuit_breaker_enabled {
            self.breaker
                .report_outcome(backend, success, policy.circuit_breaker_threshold);
        }
        self.health.observe(backend, success, Some(latency));
    }

    /// Jittered exponential delay between retry attempts.
    async fn backoff(&self, attempt: u32) {
        let shift = attempt.saturating_sub(1).min(5);
        let base_ms = 25u64 << shift;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2);
        tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
    }

    /// Emit the outcome event for a rejected request and hand the error back.
    fn reject(
        &self,
        request: &IncomingRequest,
        subject: &Subject,
        backend_id: Option<String>,
        attempts: u32,
        error: GatewayError,
    ) -> GatewayError {
        let decision = decision_for(&error);
        self.emit(
            request,
            subject,
            decision,
            backend_id,
            error.status_code().as_u16(),
            attempts,
            Some(error.to_string()),
        );
        error
    }

    /// Record metrics and emit the outcome event.
    ///
    /// Emission runs in a detached task: a caller dropping the response
    /// future right after completion cannot lose the record, and a slow sink
    /// never holds up the response.
    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        request: &IncomingRequest,
        subject: &Subject,
        decision: Decision,
        backend_id: Option<String>,
        status: u16,
        attempts: u32,
        error: Option<String>,
    ) {
        let latency = request.received_at.elapsed();
        counter!("gateway_requests_total", "decision" => decision.as_str()).increment(1);
        histogram!("gateway_request_duration_seconds", "decision" => decision.as_str())
            .record(latency.as_secs_f64());

        let event = RequestOutcomeEvent {
            request_id: request.id.clone(),
            method: request.method.to_string(),
            path: request.path().to_string(),
            subject: subject.to_string(),
            backend_id,
            decision,
            status,
            latency_ms: latency.as_millis() as u64,
            attempts,
            error,
            emitted_at: Utc::now(),
        };
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move { sink.emit(event).await });
    }
}

fn decision_for(error: &GatewayError) -> Decision {
    match error {
        GatewayError::RateLimitExceeded { .. } => Decision::Throttled,
        GatewayError::CircuitOpen { .. } => Decision::CircuitOpen,
        GatewayError::NoHealthyBackend { .. } => Decision::NoHealthyBackend,
        GatewayError::Timeout { .. } => Decision::Timeout,
        GatewayError::PolicyDenied { .. } => Decision::PolicyDenied,
        _ => Decision::BackendError,
    }
}
