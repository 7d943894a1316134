//! Retry policy and backoff composition.
//!
//! A [`RetryPolicy`] decides which responses are worth retrying and how
//! long to wait between attempts. [`Backoff`] is recursive so the common
//! "honor `Retry-After`, otherwise back off exponentially" composition
//! is a single value:
//!
//! ```
//! use colloquy_http::retry::Backoff;
//!
//! let backoff = Backoff::RetryAfterHeader {
//!     max_allowed: 10.0,
//!     retry_if_greater: false,
//!     fallback: Some(Box::new(Backoff::Exponential {
//!         base: 1.0,
//!         coefficient: 1.0,
//!         rate: 2.0,
//!         up_to_times: 5,
//!     })),
//! };
//! ```

use std::collections::HashSet;
use std::time::Duration;

use reqwest::header::HeaderMap;

use crate::error::{HttpError, HttpResult};

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// The same delay every time.
    Constant {
        /// Delay in seconds.
        seconds: f64,
    },
    /// `base + coefficient × n`, with growth capped after `up_to_times`
    /// attempts.
    Linear {
        /// Starting delay in seconds.
        base: f64,
        /// Per-attempt increment in seconds.
        coefficient: f64,
        /// Attempt number past which the delay stops growing.
        up_to_times: u32,
    },
    /// `base + coefficient × rate^n`, with growth capped after
    /// `up_to_times` attempts. `rate` must be ≥ 1.
    Exponential {
        /// Starting delay in seconds.
        base: f64,
        /// Multiplier applied to the exponential term.
        coefficient: f64,
        /// Exponential growth rate per attempt.
        rate: f64,
        /// Attempt number past which the delay stops growing.
        up_to_times: u32,
    },
    /// Honor the server's `Retry-After` header.
    RetryAfterHeader {
        /// Largest header value (seconds) accepted without question.
        max_allowed: f64,
        /// Whether to still wait when the header exceeds `max_allowed`;
        /// when `false`, such a response gives up instead.
        retry_if_greater: bool,
        /// Evaluated when the header is absent. `None` means give up.
        fallback: Option<Box<Backoff>>,
    },
}

impl Backoff {
    /// Validate the backoff tree.
    fn validate(&self) -> HttpResult<()> {
        match self {
            Self::Constant { seconds } if *seconds < 0.0 => Err(HttpError::InvalidRetryPolicy(
                "constant backoff must be non-negative".into(),
            )),
            Self::Exponential { rate, .. } if *rate < 1.0 => Err(HttpError::InvalidRetryPolicy(
                format!("exponential rate must be >= 1, got {rate}"),
            )),
            Self::RetryAfterHeader { fallback, .. } => {
                fallback.as_deref().map_or(Ok(()), Self::validate)
            },
            _ => Ok(()),
        }
    }

    /// Evaluate the delay before attempt `attempts + 1`.
    ///
    /// `None` means give up rather than retry.
    #[must_use]
    pub fn wait(&self, attempts: u32, headers: Option<&HeaderMap>) -> Option<Duration> {
        match self {
            Self::Constant { seconds } => Some(secs_f64(*seconds)),
            Self::Linear {
                base,
                coefficient,
                up_to_times,
            } => {
                let n = f64::from(attempts.min(*up_to_times));
                Some(secs_f64(base + coefficient * n))
            },
            Self::Exponential {
                base,
                coefficient,
                rate,
                up_to_times,
            } => {
                let n = attempts.min(*up_to_times);
                #[allow(clippy::cast_possible_wrap)]
                let term = rate.powi(n as i32);
                Some(secs_f64(base + coefficient * term))
            },
            Self::RetryAfterHeader {
                max_allowed,
                retry_if_greater,
                fallback,
            } => {
                let header_secs = headers.and_then(retry_after_seconds);
                match header_secs {
                    Some(secs) if secs <= *max_allowed => Some(secs_f64(secs)),
                    Some(secs) if *retry_if_greater => Some(secs_f64(secs)),
                    Some(_) => None,
                    None => fallback
                        .as_deref()
                        .and_then(|backoff| backoff.wait(attempts, headers)),
                }
            },
        }
    }
}

/// Read `Retry-After` as seconds.
fn retry_after_seconds(headers: &HeaderMap) -> Option<f64> {
    headers.get("retry-after")?.to_str().ok()?.parse().ok()
}

fn secs_f64(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

/// Which responses to retry, how many times, and with what backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    statuses: HashSet<u16>,
    max_retries: u32,
    retry_connection_errors: bool,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Build a policy.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::InvalidRetryPolicy`] when a status below 400
    /// is listed (success responses are never retry-worthy) or the
    /// backoff tree fails validation.
    pub fn new(
        statuses: impl IntoIterator<Item = u16>,
        max_retries: u32,
        retry_connection_errors: bool,
        backoff: Backoff,
    ) -> HttpResult<Self> {
        let statuses: HashSet<u16> = statuses.into_iter().collect();
        if let Some(bad) = statuses.iter().find(|s| **s < 400) {
            return Err(HttpError::InvalidRetryPolicy(format!(
                "retryable status {bad} is below 400"
            )));
        }
        backoff.validate()?;
        Ok(Self {
            statuses,
            max_retries,
            retry_connection_errors,
            backoff,
        })
    }

    /// No retries at all.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            statuses: HashSet::new(),
            max_retries: 0,
            retry_connection_errors: false,
            backoff: Backoff::Constant { seconds: 0.0 },
        }
    }

    /// The stock policy: 429 and the transient 5xx family, up to three
    /// retries, honoring `Retry-After` with an exponential fallback, one
    /// retry on connection errors.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            statuses: [429, 500, 502, 503, 504].into_iter().collect(),
            max_retries: 3,
            retry_connection_errors: true,
            backoff: Backoff::RetryAfterHeader {
                max_allowed: 30.0,
                retry_if_greater: false,
                fallback: Some(Box::new(Backoff::Exponential {
                    base: 0.5,
                    coefficient: 0.5,
                    rate: 2.0,
                    up_to_times: 6,
                })),
            },
        }
    }

    /// `attempts < max_retries ∧ status ∈ statuses`.
    #[must_use]
    pub fn should_retry(&self, status: u16, attempts: u32) -> bool {
        attempts < self.max_retries && self.statuses.contains(&status)
    }

    /// Delay before the next attempt, or `None` to give up.
    #[must_use]
    pub fn wait_before_retry(&self, attempts: u32, headers: Option<&HeaderMap>) -> Option<Duration> {
        self.backoff.wait(attempts, headers)
    }

    /// Whether a transport-level failure earns a single retry.
    #[must_use]
    pub fn retry_connection_errors(&self) -> bool {
        self.retry_connection_errors
    }
}

impl Default for RetryPolicy {
    /// Retries are opt-in; the default policy never retries.
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("retry-after", HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn statuses_below_400_are_rejected() {
        let err = RetryPolicy::new([200, 429], 3, false, Backoff::Constant { seconds: 1.0 })
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRetryPolicy(_)));
    }

    #[test]
    fn exponential_rate_below_one_is_rejected() {
        let err = RetryPolicy::new(
            [429],
            3,
            false,
            Backoff::Exponential {
                base: 1.0,
                coefficient: 1.0,
                rate: 0.5,
                up_to_times: 3,
            },
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRetryPolicy(_)));
    }

    #[test]
    fn nested_backoff_is_validated() {
        let err = RetryPolicy::new(
            [429],
            3,
            false,
            Backoff::RetryAfterHeader {
                max_allowed: 5.0,
                retry_if_greater: false,
                fallback: Some(Box::new(Backoff::Exponential {
                    base: 1.0,
                    coefficient: 1.0,
                    rate: 0.1,
                    up_to_times: 3,
                })),
            },
        )
        .unwrap_err();
        assert!(matches!(err, HttpError::InvalidRetryPolicy(_)));
    }

    #[test]
    fn should_retry_respects_status_set_and_cap() {
        let policy =
            RetryPolicy::new([429, 500], 2, false, Backoff::Constant { seconds: 0.0 }).unwrap();
        assert!(policy.should_retry(429, 0));
        assert!(policy.should_retry(500, 1));
        assert!(!policy.should_retry(500, 2), "attempt cap reached");
        assert!(!policy.should_retry(404, 0), "status not listed");
    }

    #[test]
    fn disabled_policy_never_retries() {
        let policy = RetryPolicy::disabled();
        assert!(!policy.should_retry(429, 0));
        assert!(!policy.retry_connection_errors());
    }

    #[test]
    fn constant_backoff() {
        let backoff = Backoff::Constant { seconds: 2.5 };
        assert_eq!(backoff.wait(0, None), Some(Duration::from_secs_f64(2.5)));
        assert_eq!(backoff.wait(9, None), Some(Duration::from_secs_f64(2.5)));
    }

    #[test]
    fn linear_backoff_grows_then_caps() {
        let backoff = Backoff::Linear {
            base: 1.0,
            coefficient: 2.0,
            up_to_times: 3,
        };
        assert_eq!(backoff.wait(0, None), Some(Duration::from_secs_f64(1.0)));
        assert_eq!(backoff.wait(1, None), Some(Duration::from_secs_f64(3.0)));
        assert_eq!(backoff.wait(3, None), Some(Duration::from_secs_f64(7.0)));
        // Growth capped past up_to_times.
        assert_eq!(backoff.wait(10, None), Some(Duration::from_secs_f64(7.0)));
    }

    #[test]
    fn exponential_backoff_grows_then_caps() {
        let backoff = Backoff::Exponential {
            base: 0.0,
            coefficient: 1.0,
            rate: 2.0,
            up_to_times: 4,
        };
        assert_eq!(backoff.wait(0, None), Some(Duration::from_secs_f64(1.0)));
        assert_eq!(backoff.wait(2, None), Some(Duration::from_secs_f64(4.0)));
        assert_eq!(backoff.wait(4, None), Some(Duration::from_secs_f64(16.0)));
        assert_eq!(backoff.wait(8, None), Some(Duration::from_secs_f64(16.0)));
    }

    #[test]
    fn retry_after_header_is_honored() {
        let backoff = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: false,
            fallback: None,
        };
        let headers = headers_with_retry_after("1.5");
        assert_eq!(
            backoff.wait(0, Some(&headers)),
            Some(Duration::from_secs_f64(1.5))
        );
    }

    #[test]
    fn retry_after_above_max_gives_up_unless_allowed() {
        let strict = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: false,
            fallback: None,
        };
        let lenient = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: true,
            fallback: None,
        };
        let headers = headers_with_retry_after("60");
        assert_eq!(strict.wait(0, Some(&headers)), None);
        assert_eq!(
            lenient.wait(0, Some(&headers)),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn missing_header_falls_through_to_fallback() {
        let backoff = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: false,
            fallback: Some(Box::new(Backoff::Constant { seconds: 3.0 })),
        };
        assert_eq!(backoff.wait(0, None), Some(Duration::from_secs(3)));
        assert_eq!(
            backoff.wait(0, Some(&HeaderMap::new())),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn missing_header_without_fallback_gives_up() {
        let backoff = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: false,
            fallback: None,
        };
        assert_eq!(backoff.wait(0, None), None);
    }

    #[test]
    fn nested_retry_after_recurses() {
        let backoff = Backoff::RetryAfterHeader {
            max_allowed: 10.0,
            retry_if_greater: false,
            fallback: Some(Box::new(Backoff::RetryAfterHeader {
                max_allowed: 5.0,
                retry_if_greater: false,
                fallback: Some(Box::new(Backoff::Linear {
                    base: 2.0,
                    coefficient: 0.0,
                    up_to_times: 1,
                })),
            })),
        };
        assert_eq!(backoff.wait(0, None), Some(Duration::from_secs(2)));
    }

    #[test]
    fn standard_policy_honors_retry_after() {
        let policy = RetryPolicy::standard();
        let headers = headers_with_retry_after("1.5");
        assert!(policy.should_retry(429, 0));
        assert_eq!(
            policy.wait_before_retry(0, Some(&headers)),
            Some(Duration::from_secs_f64(1.5))
        );
        // Without the header, the exponential fallback applies.
        assert_eq!(
            policy.wait_before_retry(0, None),
            Some(Duration::from_secs_f64(1.0))
        );
    }
}
