//! Per-request admission decisions.
//!
//! The limiter evaluates a resolved policy's windows against the request's
//! subject. A policy may enforce a per-second burst window and a per-minute
//! window; both must admit. Tier membership scales the configured limits via
//! a multiplier.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::admission::bucket::{BucketDecision, BucketKey, BucketStore, WindowKind};
use crate::core::error::GatewayError;
use crate::core::types::Subject;
use crate::policy::EndpointPolicy;

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct AdmitDecision {
    pub allowed: bool,
    /// Requests left in the reported window (the minute window when both
    /// are configured)
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Populated only on denial
    pub retry_after: Option<Duration>,
    /// Effective limit of the reported window, after tier scaling
    pub limit: u32,
    pub window: WindowKind,
}

impl AdmitDecision {
    fn from_bucket(limit: u32, window: WindowKind, bucket: &BucketDecision) -> Self {
        let reset_at = Utc::now()
            + chrono::Duration::from_std(bucket.reset_after)
                .unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            allowed: bucket.allowed,
            remaining: bucket.remaining,
            reset_at,
            retry_after: (!bucket.allowed).then_some(bucket.reset_after),
            limit,
            window,
        }
    }

    /// Decision for a policy that configures no rate limits.
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u32::MAX,
            reset_at: Utc::now(),
            retry_after: None,
            limit: u32::MAX,
            window: WindowKind::Minute,
        }
    }

    /// Convert a denial into the throttling error surfaced to the caller.
    pub fn to_error(&self, subject: &Subject) -> GatewayError {
        GatewayError::RateLimitExceeded {
            subject: subject.to_string(),
            limit: self.limit,
            window: self.window.to_string(),
            retry_after_secs: self
                .retry_after
                .map(|d| d.as_secs().max(1))
                .unwrap_or(1),
        }
    }
}

/// Decides admit/reject per request using the injected [`BucketStore`].
pub struct RateLimiter {
    store: Arc<BucketStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<BucketStore>) -> Self {
        Self { store }
    }

    /// Check the request's subject against the policy's windows.
    ///
    /// The burst (per-second) window is evaluated first; a burst slot
    /// consumed before a minute-window denial is not refunded. With both
    /// windows admitting, the returned decision reports the minute window's
    /// remaining count.
    pub fn admit(
        &self,
        subject: &Subject,
        policy: &EndpointPolicy,
        multiplier: f64,
    ) -> AdmitDecision {
        let policy_id = policy.id();
        let mut admitted = None;

        if let Some(rps) = policy.rate_limit_rps {
            let limit = effective_limit(rps, multiplier);
            let bucket = self.store.admit(
                BucketKey::new(subject, &policy_id, WindowKind::Second),
                limit,
                WindowKind::Second.duration(),
            );
            let decision = AdmitDecision::from_bucket(limit, WindowKind::Second, &bucket);
            if !decision.allowed {
                return self.record(subject, &policy_id, decision);
            }
            admitted = Some(decision);
        }

        if let Some(rpm) = policy.rate_limit_rpm {
            let limit = effective_limit(rpm, multiplier);
            let bucket = self.store.admit(
                BucketKey::new(subject, &policy_id, WindowKind::Minute),
                limit,
                WindowKind::Minute.duration(),
            );
            let decision = AdmitDecision::from_bucket(limit, WindowKind::Minute, &bucket);
            return self.record(subject, &policy_id, decision);
        }

        let decision = admitted.unwrap_or_else(AdmitDecision::unlimited);
        self.record(subject, &policy_id, decision)
    }

    fn record(&self, subject: &Subject, policy_id: &str, decision: AdmitDecision) -> AdmitDecision {
        if decision.allowed {
            counter!("gateway_admission_decisions_total", "decision" => "allowed").increment(1);
        } else {
            counter!("gateway_admission_decisions_total", "decision" => "throttled").increment(1);
            debug!(
                subject = %subject,
                policy = policy_id,
                window = %decision.window,
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }
        decision
    }
}

/// Scale a configured limit by the subject's tier multiplier.
///
/// Clamped to at least 1 so a fractional multiplier can never turn a
/// configured limit into an unconditional deny.
fn effective_limit(base: u32, multiplier: f64) -> u32 {
    ((base as f64) * multiplier).floor().max(1.0) as u32
}
