//! Process-wide per-token shared state.
//!
//! Rate-limit buckets and the response cache are properties of the bot
//! token, not of any one client instance: two clients built from the
//! same token must see the same buckets or they will overrun them. The
//! registry hands every client for a given token the same limiter and
//! cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use colloquy_core::BotToken;

use crate::cache::{CacheConfig, ResponseCache};
use crate::rate_limit::RateLimiter;

/// Shared per-token state.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) cache: Arc<ResponseCache>,
}

static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<SharedState>>>> = OnceLock::new();

/// Fetch (or create) the shared state for a token.
///
/// The cache configuration of the first client constructed for a token
/// wins; later clients share its cache instance. The background sweeper
/// is spawned on creation when a tokio runtime is available.
pub(crate) fn shared_for_token(token: &BotToken, cache_config: &CacheConfig) -> Arc<SharedState> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    Arc::clone(map.entry(token.fingerprint()).or_insert_with(|| {
        let cache = Arc::new(ResponseCache::new(cache_config.clone()));
        if cache.is_enabled() && tokio::runtime::Handle::try_current().is_ok() {
            let _sweeper = ResponseCache::spawn_sweeper(&cache);
        }
        Arc::new(SharedState {
            limiter: Arc::new(RateLimiter::new()),
            cache,
        })
    }))
}
