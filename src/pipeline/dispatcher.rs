//! Backend dispatch.
//!
//! The [`BackendDispatcher`] trait is the seam between the decision pipeline
//! and the transport used to reach backends. The production implementation
//! forwards over HTTP with a shared `reqwest` connection pool; tests swap in
//! scripted dispatchers.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::sync::Arc;
use std::time::Instant;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{Backend, BackendResponse, IncomingRequest};

/// Headers that must not be forwarded to a backend.
///
/// Hop-by-hop headers plus the ones the HTTP client derives itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Sends one request to one backend.
#[async_trait]
pub trait BackendDispatcher: Send + Sync {
    /// Dispatch the request and return the backend's response.
    ///
    /// Implementations do not enforce the policy timeout; the pipeline bounds
    /// every attempt. A returned response may carry any status, including
    /// 5xx; classifying it is the pipeline's job.
    async fn dispatch(
        &self,
        backend: &Backend,
        request: &IncomingRequest,
    ) -> GatewayResult<BackendResponse>;
}

/// HTTP dispatcher with a shared connection pool.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        backend: &Backend,
        request: &IncomingRequest,
    ) -> GatewayResult<BackendResponse> {
        let mut url = backend.url_for(request.path());
        if let Some(query) = request.query() {
            url.push('?');
            url.push_str(query);
        }

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("Invalid request method: {}", e)))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if !request.body.is_empty() {
            builder = builder.body((*request.body).clone());
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::backend_error(backend.id.clone(), e.to_string()))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::internal(format!("Invalid backend status: {}", e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::backend_error(backend.id.clone(), e.to_string()))?
            .to_vec();

        Ok(BackendResponse {
            status,
            headers,
            body: Arc::new(body),
            latency: started.elapsed(),
        })
    }
}
