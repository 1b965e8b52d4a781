//! Admission control.
//!
//! Fixed-window rate limiting keyed by `(subject, policy, window)`. The
//! [`BucketStore`] owns the counters; the [`RateLimiter`] applies a policy's
//! per-minute and per-second windows with AND semantics.

pub mod bucket;
pub mod limiter;

pub use bucket::{BucketDecision, BucketKey, BucketStore, WindowKind};
pub use limiter::{AdmitDecision, RateLimiter};
