//! End-to-end pipeline tests against real HTTP backends.
//!
//! Each backend is a wiremock server, so these tests exercise the full path:
//! policy resolution, admission, selection, HTTP dispatch through reqwest,
//! outcome reporting, and the errors surfaced to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use inference_gateway::admission::{BucketStore, RateLimiter};
use inference_gateway::balancer::LoadBalancer;
use inference_gateway::breaker::CircuitBreaker;
use inference_gateway::core::config::{CircuitBreakerSettings, HealthConfig};
use inference_gateway::discovery::BackendRegistry;
use inference_gateway::events::TracingOutcomeSink;
use inference_gateway::pipeline::{DecisionPipeline, HttpDispatcher};
use inference_gateway::policy::{EndpointPolicy, PolicySnapshot, PolicyStore};
use inference_gateway::{Backend, GatewayError};

struct Harness {
    pipeline: DecisionPipeline,
    breaker: Arc<CircuitBreaker>,
}

fn policy(pattern: &str, http_method: &str) -> EndpointPolicy {
    EndpointPolicy {
        service_name: "llm".to_string(),
        method: http_method.to_string(),
        path_pattern: pattern.to_string(),
        rate_limit_rpm: None,
        rate_limit_rps: None,
        auth_required: false,
        timeout_seconds: 1,
        retry_attempts: 0,
        circuit_breaker_enabled: true,
        circuit_breaker_threshold: 5,
    }
}

fn build_pipeline(policies: Vec<EndpointPolicy>, backends: Vec<Backend>) -> Harness {
    let snapshot = PolicySnapshot::compile(&policies, &[], &[]).unwrap();
    let store = Arc::new(PolicyStore::new(snapshot));
    let limiter = Arc::new(RateLimiter::new(Arc::new(BucketStore::new())));
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerSettings {
        cooldown: Duration::from_millis(100),
        max_cooldown: Duration::from_secs(1),
        half_open_trials: 1,
    }));
    let health = Arc::new(inference_gateway::health::HealthMonitor::new(HealthConfig {
        probe_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(1),
        unhealthy_threshold: 10,
    }));
    let registry = Arc::new(BackendRegistry::new());
    for backend in backends {
        breaker.register(&backend.id);
        health.register(&backend.id);
        registry.register(backend);
    }
    let balancer = Arc::new(LoadBalancer::new(Arc::clone(&breaker), Arc::clone(&health)));

    let pipeline = DecisionPipeline::new(
        store,
        limiter,
        Arc::clone(&breaker),
        health,
        registry,
        balancer,
        Arc::new(HttpDispatcher::new()),
        Arc::new(TracingOutcomeSink),
    );

    Harness { pipeline, breaker }
}

fn request(http_method: Method, uri: &str) -> inference_gateway::IncomingRequest {
    inference_gateway::IncomingRequest::new(
        http_method,
        uri.parse().unwrap(),
        HeaderMap::new(),
        Vec::new(),
        Some("10.0.0.1:5000".parse().unwrap()),
    )
}

#[tokio::test]
async fn test_request_flows_through_to_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("done"))
        .expect(1)
        .mount(&server)
        .await;

    let h = build_pipeline(
        vec![policy("/api/generate", "POST")],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    let response = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.backend_id, "llm-0");
    assert_eq!(response.attempts, 1);
    assert_eq!(&response.body[..], b"done");
}

#[tokio::test]
async fn test_headers_and_query_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(query_param("stream", "false"))
        .and(header("x-api-key", "key-1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = build_pipeline(
        vec![policy("/api/generate", "POST")],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    let mut incoming = request(Method::POST, "/api/generate?stream=false");
    incoming
        .headers
        .insert("x-api-key", "key-1".parse().unwrap());

    // A request the mock does not match would come back 404.
    let response = h.pipeline.execute(incoming).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_retry_moves_to_the_other_backend() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .expect(1)
        .mount(&healthy)
        .await;

    let mut p = policy("/api/generate", "POST");
    p.retry_attempts = 1;
    // Sorted candidate order makes llm-0 the first selection while idle.
    let h = build_pipeline(
        vec![p],
        vec![
            Backend::new("llm-0", "llm", failing.uri()),
            Backend::new("llm-1", "llm", healthy.uri()),
        ],
    );

    let response = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.backend_id, "llm-1");
    assert_eq!(response.attempts, 2);
    assert_eq!(&response.body[..], b"recovered");
}

#[tokio::test]
async fn test_repeated_failures_open_the_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut p = policy("/api/generate", "POST");
    p.circuit_breaker_threshold = 2;
    let h = build_pipeline(
        vec![p],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    for _ in 0..2 {
        let error = h
            .pipeline
            .execute(request(Method::POST, "/api/generate"))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_GATEWAY);
    }

    // The open breaker removes the only candidate before dispatch.
    let error = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap_err();
    assert!(matches!(error, GatewayError::NoHealthyBackend { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let snapshots = h.breaker.snapshots();
    assert_eq!(snapshots[0].state, "open");
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open_trial() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut p = policy("/api/generate", "POST");
    p.circuit_breaker_threshold = 2;
    let h = build_pipeline(
        vec![p],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    for _ in 0..2 {
        let _ = h
            .pipeline
            .execute(request(Method::POST, "/api/generate"))
            .await;
    }
    assert_eq!(h.breaker.snapshots()[0].state, "open");

    // Past the cooldown the next request is the half-open trial; its success
    // closes the breaker.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let response = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(h.breaker.snapshots()[0].state, "closed");
}

#[tokio::test]
async fn test_slow_backend_surfaces_gateway_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let h = build_pipeline(
        vec![policy("/api/generate", "POST")],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    let started = Instant::now();
    let error = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap_err();

    assert!(matches!(error, GatewayError::Timeout { .. }));
    assert_eq!(error.status_code(), StatusCode::GATEWAY_TIMEOUT);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn test_throttled_request_never_reaches_the_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut p = policy("/api/generate", "POST");
    p.rate_limit_rpm = Some(1);
    let h = build_pipeline(
        vec![p],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    h.pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap();

    let error = h
        .pipeline
        .execute(request(Method::POST, "/api/generate"))
        .await
        .unwrap_err();
    match error {
        GatewayError::RateLimitExceeded {
            limit,
            retry_after_secs,
            ..
        } => {
            assert_eq!(limit, 1);
            assert!(retry_after_secs >= 1);
        }
        other => panic!("expected RateLimitExceeded, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_route_is_denied_without_dispatch() {
    let server = MockServer::start().await;
    let h = build_pipeline(
        vec![policy("/api/generate", "POST")],
        vec![Backend::new("llm-0", "llm", server.uri())],
    );

    let error = h
        .pipeline
        .execute(request(Method::DELETE, "/api/generate"))
        .await
        .unwrap_err();

    assert!(matches!(error, GatewayError::PolicyDenied { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}
