//! The HTTP client core: cache, rate limiting, and retry around a
//! `reqwest` transport.
//!
//! Every request runs the same pipeline: cache lookup, rate-limit
//! admission, URL build, send with timeout, header observation, retry
//! loop, cache store. The pipeline never interprets response bodies —
//! model decoding belongs to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use colloquy_core::{api_base, BotToken};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::cache::{CacheConfig, CacheKey, CachedResponse, ResponseCache};
use crate::endpoint::Endpoint;
use crate::error::{HttpError, HttpResult};
use crate::rate_limit::RateLimiter;
use crate::registry;
use crate::retry::RetryPolicy;

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide request id counter for log correlation.
static REQUEST_IDS: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> u64 {
    REQUEST_IDS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// Response cache settings (off by default).
    pub cache: CacheConfig,
    /// Retry policy (no retries by default).
    pub retry: RetryPolicy,
    /// REST base URL with trailing slash. Overridable for tests.
    pub api_base: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            user_agent: format!(
                "DiscordBot (https://github.com/colloquy-rs/colloquy, {})",
                env!("CARGO_PKG_VERSION")
            ),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            api_base: api_base(),
        }
    }
}

/// A response from the pipeline.
///
/// Non-2xx statuses other than retried ones are returned as-is; use
/// [`ApiResponse::is_success`] before decoding.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Decoded JSON body (`Null` for empty bodies).
    pub body: serde_json::Value,
    /// `true` when served from the response cache without a network send.
    pub cached: bool,
}

impl ApiResponse {
    /// `true` for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The HTTP client core.
///
/// Cheap to clone-free share behind an `Arc`; the rate limiter and the
/// cache are shared process-wide with every other client built from the
/// same token.
#[derive(Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    token: BotToken,
    config: HttpClientConfig,
    shared: std::sync::Arc<registry::SharedState>,
}

impl HttpClient {
    /// Build a client for a token.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transport`] if the underlying TLS/connector
    /// stack fails to initialize.
    pub fn new(token: BotToken, config: HttpClientConfig) -> HttpResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        let shared = registry::shared_for_token(&token, &config.cache);
        Ok(Self {
            http,
            token,
            config,
            shared,
        })
    }

    /// The shared rate limiter for this token.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// The shared response cache for this token.
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.shared.cache
    }

    /// Send a request through the pipeline.
    ///
    /// `path_params` interpolate into the endpoint's URL template;
    /// `queries` are appended in order; `payload` becomes a JSON body.
    ///
    /// # Errors
    ///
    /// [`HttpError::RateLimited`] when the local limiter denies the
    /// request before send; [`HttpError::Transport`] for connection
    /// failures after any permitted retry; [`HttpError::MissingPathParam`]
    /// for template/parameter mismatches.
    pub async fn send(
        &self,
        endpoint: &Endpoint,
        path_params: &[(&str, &str)],
        queries: &[(&str, &str)],
        payload: Option<&serde_json::Value>,
    ) -> HttpResult<ApiResponse> {
        let request_id = next_request_id();
        let description = endpoint.url_description(path_params);

        let owned_queries: Vec<(String, String)> = queries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let cache_key = endpoint
            .cacheable_identity
            .filter(|_| self.shared.cache.is_enabled())
            .map(|identity| CacheKey::new(identity, &owned_queries));

        if let Some(key) = &cache_key {
            if let Some(hit) = self.shared.cache.get(key).await {
                debug!(request_id, endpoint = %description, "served from cache");
                return Ok(ApiResponse {
                    status: hit.status,
                    body: hit.body,
                    cached: true,
                });
            }
        }

        let url = self.build_url(endpoint, path_params, queries)?;
        let mut attempts: u32 = 0;
        let mut connection_retry_used = false;

        loop {
            if !self.shared.limiter.should_request(endpoint).await {
                return Err(HttpError::RateLimited {
                    endpoint: endpoint.id,
                });
            }

            let mut request = self
                .http
                .request(endpoint.method.into(), url.clone())
                .timeout(self.config.request_timeout);
            if endpoint.requires_auth {
                let mut auth = reqwest::header::HeaderValue::try_from(self.token.authorization())
                    .map_err(|e| HttpError::InvalidUrl(format!("invalid token bytes: {e}")))?;
                auth.set_sensitive(true);
                request = request.header(AUTHORIZATION, auth);
            }
            if let Some(body) = payload {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .json(body);
            }

            debug!(
                request_id,
                endpoint = %description,
                method = endpoint.method.as_str(),
                attempt = attempts,
                "sending request"
            );

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    // Connection errors skip `observe`; at most one retry.
                    if self.config.retry.retry_connection_errors() && !connection_retry_used {
                        connection_retry_used = true;
                        let wait = self
                            .config
                            .retry
                            .wait_before_retry(attempts, None)
                            .unwrap_or(Duration::ZERO);
                        warn!(
                            request_id,
                            endpoint = %description,
                            error = %err,
                            wait_ms = wait.as_millis(),
                            "connection error, retrying once"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    return Err(err.into());
                },
            };

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            self.shared.limiter.observe(endpoint, &headers, status).await;
            debug!(request_id, endpoint = %description, status, "response received");

            if self.config.retry.should_retry(status, attempts) {
                if let Some(wait) = self.config.retry.wait_before_retry(attempts, Some(&headers)) {
                    attempts = attempts.saturating_add(1);
                    debug!(
                        request_id,
                        endpoint = %description,
                        status,
                        attempt = attempts,
                        wait_ms = wait.as_millis(),
                        "retrying after backoff"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            let body = Self::read_json_body(response).await?;

            if (200..300).contains(&status) {
                if let Some(key) = cache_key {
                    self.shared
                        .cache
                        .put(
                            key,
                            CachedResponse {
                                status,
                                body: body.clone(),
                            },
                        )
                        .await;
                }
            }

            return Ok(ApiResponse {
                status,
                body,
                cached: false,
            });
        }
    }

    /// Fully-qualified URL: base + interpolated path + query string.
    fn build_url(
        &self,
        endpoint: &Endpoint,
        path_params: &[(&str, &str)],
        queries: &[(&str, &str)],
    ) -> HttpResult<url::Url> {
        let path = endpoint.render_path(path_params)?;
        let full = format!("{}{}", self.config.api_base, path);
        let mut url =
            url::Url::parse(&full).map_err(|e| HttpError::InvalidUrl(format!("{full}: {e}")))?;
        if !queries.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in queries {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    async fn read_json_body(response: reqwest::Response) -> HttpResult<serde_json::Value> {
        let text = response.text().await?;
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}
