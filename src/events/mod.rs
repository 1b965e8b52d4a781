//! Request outcome events.
//!
//! Every pipeline execution emits exactly one [`RequestOutcomeEvent`] to an
//! [`OutcomeSink`]. The sink is a write-only collaborator (log, database,
//! analytics feed); the core never reads events back.

use async_trait::async_trait;
use tracing::info;

use crate::core::types::RequestOutcomeEvent;

/// External destination for per-request outcome records.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn emit(&self, event: RequestOutcomeEvent);
}

/// Sink writing outcome events to the structured log.
pub struct TracingOutcomeSink;

#[async_trait]
impl OutcomeSink for TracingOutcomeSink {
    async fn emit(&self, event: RequestOutcomeEvent) {
        info!(
            target: "gateway::outcome",
            request_id = %event.request_id,
            method = %event.method,
            path = %event.path,
            subject = %event.subject,
            backend = event.backend_id.as_deref().unwrap_or("-"),
            decision = %event.decision,
            status = event.status,
            latency_ms = event.latency_ms,
            attempts = event.attempts,
            error = event.error.as_deref().unwrap_or(""),
            "Request outcome"
        );
    }
}
