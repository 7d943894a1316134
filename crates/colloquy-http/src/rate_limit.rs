//! Per-bucket rate limiting keyed by server-reported bucket ids.
//!
//! Discord groups endpoints into rate-limit buckets and names the bucket
//! in the `X-RateLimit-Bucket` response header; the `endpoint → bucket`
//! mapping is therefore discovered lazily from responses. The limiter is
//! a coordination hint only — the authoritative signal remains the
//! server's 429, which the retry engine handles.
//!
//! Callers must [`RateLimiter::should_request`] before sending and
//! [`RateLimiter::observe`] after receiving a response (a connection
//! error skips observe).

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::HeaderMap;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;

const HEADER_BUCKET: &str = "x-ratelimit-bucket";
const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_SCOPE: &str = "x-ratelimit-scope";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// Requests per second permitted against the global bucket.
const GLOBAL_REQUESTS_PER_SECOND: u32 = 50;

/// State for one server-side bucket.
#[derive(Debug, Clone)]
struct Bucket {
    /// Total requests the bucket admits per window.
    limit: u32,
    /// Requests left in the current window (decremented optimistically).
    remaining: u32,
    /// Absolute end of the current window.
    reset_at: DateTime<Utc>,
    /// Requests admitted but not yet observed.
    pending: u32,
}

/// The process-global per-second bucket plus any server-imposed
/// global exhaustion window.
#[derive(Debug)]
struct GlobalBucket {
    used: u32,
    window_start: DateTime<Utc>,
    exhausted_until: Option<DateTime<Utc>>,
}

impl GlobalBucket {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            used: 0,
            window_start: now,
            exhausted_until: None,
        }
    }

    /// Admit one request against the per-second window, or refuse.
    fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(until) = self.exhausted_until {
            if now < until {
                return false;
            }
            self.exhausted_until = None;
        }

        if now.signed_duration_since(self.window_start) >= ChronoDuration::seconds(1) {
            self.window_start = now;
            self.used = 0;
        }

        if self.used >= GLOBAL_REQUESTS_PER_SECOND {
            return false;
        }
        self.used = self.used.saturating_add(1);
        true
    }
}

#[derive(Debug)]
struct LimiterState {
    /// Lazily discovered `endpoint id → bucket key` mapping.
    routes: HashMap<&'static str, String>,
    /// `bucket key → bucket state`.
    buckets: HashMap<String, Bucket>,
    global: GlobalBucket,
}

/// Snapshot of one bucket's state, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    /// Server-assigned bucket key.
    pub bucket_key: String,
    /// Window size.
    pub limit: u32,
    /// Requests left in the window.
    pub remaining: u32,
    /// Admitted-but-unobserved requests.
    pub pending: u32,
}

/// Per-bucket rate limiter shared by every client holding the same token.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create an empty limiter; buckets populate from response headers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimiterState {
                routes: HashMap::new(),
                buckets: HashMap::new(),
                global: GlobalBucket::new(Utc::now()),
            }),
        }
    }

    /// Admission decision for one request, decrementing optimistically.
    ///
    /// Returns `false` when the endpoint's bucket is exhausted and its
    /// window has not reset, or when the global bucket is exhausted.
    pub async fn should_request(&self, endpoint: &Endpoint) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if endpoint.counts_against_global_limit && !state.global.try_acquire(now) {
            trace!(endpoint = endpoint.id, "global bucket exhausted");
            return false;
        }

        let Some(key) = state.routes.get(endpoint.id).cloned() else {
            // Bucket unknown until the first response is observed.
            return true;
        };
        let Some(bucket) = state.buckets.get_mut(&key) else {
            return true;
        };

        if bucket.remaining == 0 {
            if now < bucket.reset_at {
                trace!(
                    endpoint = endpoint.id,
                    bucket = %key,
                    reset_at = %bucket.reset_at,
                    "bucket exhausted"
                );
                return false;
            }
            // Window rolled over; refill until the server says otherwise.
            bucket.remaining = bucket.limit;
        }

        bucket.remaining = bucket.remaining.saturating_sub(1);
        bucket.pending = bucket.pending.saturating_add(1);
        true
    }

    /// Fold a response's rate-limit headers into bucket state.
    ///
    /// A 429 scoped `global` marks the global bucket exhausted until
    /// `Retry-After` has elapsed.
    pub async fn observe(&self, endpoint: &Endpoint, headers: &HeaderMap, status: u16) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(key) = header_str(headers, HEADER_BUCKET) {
            let key = key.to_string();
            let limit = header_u32(headers, HEADER_LIMIT).unwrap_or(1);
            let remaining = header_u32(headers, HEADER_REMAINING).unwrap_or(0);
            let reset_at = header_f64(headers, HEADER_RESET)
                .and_then(epoch_seconds_to_datetime)
                .or_else(|| {
                    header_f64(headers, HEADER_RESET_AFTER)
                        .map(|secs| now + chrono_seconds(secs))
                })
                .unwrap_or(now);

            let pending = state
                .buckets
                .get(&key)
                .map_or(0, |b| b.pending.saturating_sub(1));

            debug!(
                endpoint = endpoint.id,
                bucket = %key,
                limit,
                remaining,
                reset_at = %reset_at,
                "rate-limit headers observed"
            );

            state.routes.insert(endpoint.id, key.clone());
            state.buckets.insert(
                key,
                Bucket {
                    limit,
                    remaining,
                    reset_at,
                    pending,
                },
            );
        } else if let Some(key) = state.routes.get(endpoint.id).cloned() {
            if let Some(bucket) = state.buckets.get_mut(&key) {
                bucket.pending = bucket.pending.saturating_sub(1);
            }
        }

        if status == 429 {
            let scope = header_str(headers, HEADER_SCOPE);
            if scope == Some("global") {
                let retry_after = header_f64(headers, HEADER_RETRY_AFTER).unwrap_or(1.0);
                let until = now + chrono_seconds(retry_after);
                warn!(
                    endpoint = endpoint.id,
                    retry_after, "global rate limit hit"
                );
                state.global.exhausted_until = Some(until);
            }
        }
    }

    /// Snapshot of the bucket currently mapped to `endpoint`, if any.
    pub async fn bucket_snapshot(&self, endpoint: &Endpoint) -> Option<BucketSnapshot> {
        let state = self.state.lock().await;
        let key = state.routes.get(endpoint.id)?;
        let bucket = state.buckets.get(key)?;
        Some(BucketSnapshot {
            bucket_key: key.clone(),
            limit: bucket.limit,
            remaining: bucket.remaining,
            pending: bucket.pending,
        })
    }
}

// ── Header parsing ───────────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name)?.parse().ok()
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)?.parse().ok()
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_seconds_to_datetime(secs: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
}

#[allow(clippy::cast_possible_truncation)]
fn chrono_seconds(secs: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((secs * 1000.0) as i64)
}
