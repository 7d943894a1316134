//! TTL cache over successful responses.
//!
//! Keys are (cacheable identity, ordered query pairs) — two calls to the
//! same identity with the same query list share an entry regardless of
//! which concrete endpoint instance produced them. Disabled by default;
//! when enabled, entries live for a default 5 s with per-identity
//! overrides (gateway discovery is effectively static and cached for an
//! hour).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::endpoint::CacheIdentity;

/// Default entry lifetime when no per-identity override applies.
const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Gateway URLs change rarely; cache them for an hour.
const GATEWAY_TTL: Duration = Duration::from_secs(60 * 60);

/// Interval between sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; the cache stores nothing while disabled.
    pub enabled: bool,
    /// Lifetime for identities without an override.
    pub default_ttl: Duration,
    /// Per-identity lifetime overrides.
    pub overrides: HashMap<CacheIdentity, Duration>,
    /// How often the background sweeper purges expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(CacheIdentity::Gateway, GATEWAY_TTL);
        overrides.insert(CacheIdentity::GatewayBot, GATEWAY_TTL);
        Self {
            enabled: false,
            default_ttl: DEFAULT_TTL,
            overrides,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the master switch on.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// Cache key: identity plus the ordered query pairs of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    identity: CacheIdentity,
    queries: Vec<(String, String)>,
}

impl CacheKey {
    /// Build a key from an identity and the request's query pairs.
    ///
    /// Order is significant: the pairs are stored as supplied, matching
    /// the order they are appended to the URL.
    #[must_use]
    pub fn new(identity: CacheIdentity, queries: &[(String, String)]) -> Self {
        Self {
            identity,
            queries: queries.to_vec(),
        }
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// HTTP status of the original response (always 2xx).
    pub status: u16,
    /// Decoded JSON body.
    pub body: serde_json::Value,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: DateTime<Utc>,
}

/// TTL response cache shared by every client holding the same token.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    /// Create a cache with the given configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// `true` when the master switch is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The lifetime applied to `identity`.
    #[must_use]
    pub fn ttl_for(&self, identity: CacheIdentity) -> Duration {
        self.config
            .overrides
            .get(&identity)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    /// Fetch an unexpired entry, evicting it if its TTL has lapsed.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        if !self.config.enabled {
            return None;
        }
        let now = Utc::now();

        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if now < entry.expires_at => {
                    trace!(identity = ?key.identity, "cache hit");
                    return Some(entry.response.clone());
                },
                Some(_) => {},
                None => return None,
            }
        }

        // Expired: evict under the write lock.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| now >= e.expires_at) {
            entries.remove(key);
            trace!(identity = ?key.identity, "expired entry evicted");
        }
        None
    }

    /// Store a response. Only 2xx responses with a positive TTL for the
    /// key's identity are kept.
    pub async fn put(&self, key: CacheKey, response: CachedResponse) {
        if !self.config.enabled {
            return;
        }
        if !(200..300).contains(&response.status) {
            return;
        }
        let ttl = self.ttl_for(key.identity);
        if ttl.is_zero() {
            return;
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));

        debug!(identity = ?key.identity, ttl_secs = ttl.as_secs(), "response cached");
        self.entries
            .write()
            .await
            .insert(key, CacheEntry {
                response,
                expires_at,
            });
    }

    /// Purge every expired entry. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        let removed = before.saturating_sub(entries.len());
        if removed > 0 {
            debug!(removed, "cache sweep");
        }
        removed
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// `true` when no entries are stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spawn the periodic sweeper. The task exits when the cache is
    /// dropped by every other holder.
    pub fn spawn_sweeper(cache: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(cache);
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(cache) = weak.upgrade() else {
                    return;
                };
                cache.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response() -> CachedResponse {
        CachedResponse {
            status: 200,
            body: serde_json::json!({"id": "1"}),
        }
    }

    fn enabled_cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::enabled())
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = ResponseCache::new(CacheConfig::default());
        let key = CacheKey::new(CacheIdentity::GetChannel, &[]);
        cache.put(key.clone(), ok_response()).await;
        assert!(cache.get(&key).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn put_and_get_within_ttl() {
        let cache = enabled_cache();
        let key = CacheKey::new(CacheIdentity::GetChannel, &[]);
        cache.put(key.clone(), ok_response()).await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body["id"], "1");
    }

    #[tokio::test]
    async fn non_2xx_is_not_stored() {
        let cache = enabled_cache();
        let key = CacheKey::new(CacheIdentity::GetChannel, &[]);
        cache
            .put(
                key.clone(),
                CachedResponse {
                    status: 404,
                    body: serde_json::Value::Null,
                },
            )
            .await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn zero_ttl_identity_is_not_stored() {
        let mut config = CacheConfig::enabled();
        config
            .overrides
            .insert(CacheIdentity::GetChannel, Duration::ZERO);
        let cache = ResponseCache::new(config);
        let key = CacheKey::new(CacheIdentity::GetChannel, &[]);
        cache.put(key.clone(), ok_response()).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_get() {
        let mut config = CacheConfig::enabled();
        config.default_ttl = Duration::from_millis(10);
        config.overrides.clear();
        let cache = ResponseCache::new(config);
        let key = CacheKey::new(CacheIdentity::GetChannel, &[]);
        cache.put(key.clone(), ok_response()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none());
        assert!(cache.is_empty().await, "expired entry should be evicted");
    }

    #[tokio::test]
    async fn query_pairs_distinguish_keys() {
        let cache = enabled_cache();
        let with_limit = CacheKey::new(
            CacheIdentity::GetChannel,
            &[("limit".into(), "10".into())],
        );
        let without = CacheKey::new(CacheIdentity::GetChannel, &[]);

        cache.put(with_limit.clone(), ok_response()).await;
        assert!(cache.get(&with_limit).await.is_some());
        assert!(cache.get(&without).await.is_none());
    }

    #[tokio::test]
    async fn query_order_is_significant() {
        let a = CacheKey::new(
            CacheIdentity::GetChannel,
            &[("a".into(), "1".into()), ("b".into(), "2".into())],
        );
        let b = CacheKey::new(
            CacheIdentity::GetChannel,
            &[("b".into(), "2".into()), ("a".into(), "1".into())],
        );
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn gateway_identity_has_long_ttl() {
        let cache = enabled_cache();
        assert_eq!(
            cache.ttl_for(CacheIdentity::Gateway),
            Duration::from_secs(3600)
        );
        assert_eq!(
            cache.ttl_for(CacheIdentity::GetChannel),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let mut config = CacheConfig::enabled();
        config.default_ttl = Duration::from_millis(10);
        config.overrides.clear();
        let cache = ResponseCache::new(config);

        cache
            .put(CacheKey::new(CacheIdentity::GetChannel, &[]), ok_response())
            .await;
        cache
            .put(CacheKey::new(CacheIdentity::GetGuild, &[]), ok_response())
            .await;
        assert_eq!(cache.len().await, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.sweep().await, 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn sweeper_task_exits_when_cache_dropped() {
        let mut config = CacheConfig::enabled();
        config.sweep_interval = Duration::from_millis(5);
        let cache = Arc::new(ResponseCache::new(config));
        let handle = ResponseCache::spawn_sweeper(&cache);

        drop(cache);
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "sweeper should exit after cache drop");
    }
}
