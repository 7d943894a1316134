//! Colloquy HTTP - Hardened request pipeline for the Discord REST API.
//!
//! Every request runs through the same pipeline:
//!
//! ```text
//! send(endpoint, params, queries, payload)
//! ├── response cache (TTL, off by default)     — cache.rs
//! ├── rate limiter (per-bucket + global)       — rate_limit.rs
//! ├── URL build (template + percent-encoding)  — endpoint.rs
//! ├── reqwest transport with timeout
//! ├── header observation → rate limiter
//! └── retry engine (statuses + backoff)        — retry.rs
//! ```
//!
//! The rate limiter and cache are process-wide per bot token: every
//! [`HttpClient`] built from the same token shares them (registry.rs).
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_core::BotToken;
//! use colloquy_http::{endpoint, HttpClient, HttpClientConfig};
//!
//! let token = BotToken::from_env("DISCORD_BOT_TOKEN").expect("token");
//! let client = HttpClient::new(token, HttpClientConfig::default())?;
//! let channel = client
//!     .send(&endpoint::GET_CHANNEL, &[("channel_id", "123")], &[], None)
//!     .await?;
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod cache;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod rate_limit;
mod registry;
pub mod retry;

pub use cache::{CacheConfig, CacheKey, CachedResponse, ResponseCache};
pub use client::{ApiResponse, HttpClient, HttpClientConfig};
pub use endpoint::{CacheIdentity, Endpoint, Method};
pub use error::{HttpError, HttpResult};
pub use rate_limit::{BucketSnapshot, RateLimiter};
pub use retry::{Backoff, RetryPolicy};
