//! Fixed-window rate-limit buckets.
//!
//! A bucket counts requests for one `(subject, policy, window)` key. Buckets
//! are created lazily on first use and logically replaced (never carried over)
//! when their window expires. All bucket state lives in a [`BucketStore`],
//! a concurrent map injected into the limiter rather than held globally.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::types::{Subject, SubjectKind};

/// The two window sizes a policy can enforce.
///
/// A policy may carry both; each gets its own bucket and both must admit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Per-minute window
    Minute,
    /// Per-second burst window
    Second,
}

impl WindowKind {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Second => Duration::from_secs(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Second => "second",
        }
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one counting window: who, under which policy, at which size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub subject_kind: SubjectKind,
    pub subject_id: String,
    pub policy_id: String,
    pub window: WindowKind,
}

impl BucketKey {
    pub fn new(subject: &Subject, policy_id: &str, window: WindowKind) -> Self {
        Self {
            subject_kind: subject.kind,
            subject_id: subject.id.clone(),
            policy_id: policy_id.to_string(),
            window,
        }
    }
}

/// One active counting window.
#[derive(Debug, Clone)]
struct Bucket {
    window_start: Instant,
    window: Duration,
    reset_at: Instant,
    count: u32,
    max_requests: u32,
}

impl Bucket {
    fn new(now: Instant, window: Duration, max_requests: u32) -> Self {
        Self {
            window_start: now,
            window,
            reset_at: now + window,
            count: 0,
            max_requests,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.reset_at
    }
}

/// Result of one bucket check.
#[derive(Debug, Clone)]
pub struct BucketDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the window resets, measured at decision time
    pub reset_after: Duration,
}

/// Concurrent store of all rate-limit buckets.
///
/// The window-rollover-then-increment sequence runs under the entry lock for
/// the key, so two racing callers can never both create overlapping windows
/// or both take the last slot. Unrelated keys never contend beyond their map
/// shard.
pub struct BucketStore {
    buckets: DashMap<BucketKey, Bucket>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Count one request against the key's current window.
    ///
    /// Creates a fresh window if none exists or the active one has expired,
    /// then increments only while `count < max_requests`. `max_requests` is
    /// re-applied on every call so a policy reload or tier change takes
    /// effect mid-window.
    pub fn admit(&self, key: BucketKey, max_requests: u32, window: Duration) -> BucketDecision {
        self.admit_at(key, max_requests, window, Instant::now())
    }

    fn admit_at(
        &self,
        key: BucketKey,
        max_requests: u32,
        window: Duration,
        now: Instant,
    ) -> BucketDecision {
        let mut entry = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(now, window, max_requests));
        let bucket = entry.value_mut();

        if bucket.expired(now) {
            *bucket = Bucket::new(now, window, max_requests);
        }
        bucket.max_requests = max_requests;

        let allowed = bucket.count < bucket.max_requests;
        if allowed {
            bucket.count += 1;
        }

        BucketDecision {
            allowed,
            remaining: bucket.max_requests.saturating_sub(bucket.count),
            reset_after: bucket.reset_at.saturating_duration_since(now),
        }
    }

    /// Drop buckets whose window expired more than one grace period ago.
    ///
    /// The grace period is twice the bucket's own window, so a recently
    /// expired bucket survives long enough for a denied caller to observe
    /// its `reset_at`.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now < bucket.reset_at + bucket.window * 2);
        before - self.buckets.len()
    }

    /// Periodic sweeper task reclaiming expired buckets.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                metrics::gauge!("gateway_rate_limit_buckets").set(store.len() as f64);
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired rate-limit buckets");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new()
    }
}
