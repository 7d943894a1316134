//! Gateway configuration.

use std::time::Duration;

use colloquy_core::{BotToken, Intents};
use colloquy_http::HttpClientConfig;
use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::protocol::{IdentifyProperties, PresenceUpdate};

/// How many shards to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardCount {
    /// Ask the gateway-bot discovery endpoint for the recommended count
    /// (which also supplies the identify concurrency).
    Auto,
    /// Run exactly this many shards.
    Exact(u32),
}

impl Default for ShardCount {
    fn default() -> Self {
        Self::Exact(1)
    }
}

/// Reconnect behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    /// Backoff cap, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    /// Consecutive failed attempts tolerated before the shard stops.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    128_000
}

fn default_max_attempts() -> u32 {
    u32::MAX
}

/// Configuration for a gateway connection (or a cluster of them).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bot credential.
    pub token: BotToken,
    /// Intent bitset sent with identify.
    pub intents: Intents,
    /// Shard count strategy.
    pub shards: ShardCount,
    /// Presence sent with identify, if any.
    pub presence: Option<PresenceUpdate>,
    /// Identify connection properties.
    pub properties: IdentifyProperties,
    /// Whether to request payload compression in identify. The JSON
    /// transport here does not negotiate transport compression, so this
    /// stays `false` unless a consumer supplies its own inflater.
    pub compress: bool,
    /// Member count above which a guild is considered large (≤ 250).
    pub large_threshold: Option<u16>,
    /// Reconnect backoff settings.
    pub reconnect: ReconnectConfig,
    /// How long to wait for Hello after the transport opens.
    pub hello_timeout: Duration,
    /// How long identify may go unacknowledged before reconnecting.
    pub ready_timeout: Duration,
    /// Grace period for `disconnect()` before the transport is aborted.
    pub disconnect_grace: Duration,
    /// Per-subscriber event queue depth.
    pub event_buffer: usize,
    /// HTTP pipeline settings used for gateway discovery.
    pub http: HttpClientConfig,
}

impl GatewayConfig {
    /// Configuration with defaults for everything but the token.
    #[must_use]
    pub fn new(token: BotToken) -> Self {
        Self {
            token,
            intents: Intents::default(),
            shards: ShardCount::default(),
            presence: None,
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: None,
            reconnect: ReconnectConfig::default(),
            hello_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
            disconnect_grace: Duration::from_secs(5),
            event_buffer: DEFAULT_EVENT_CAPACITY,
            http: HttpClientConfig::default(),
        }
    }

    /// Set the intents.
    #[must_use]
    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    /// Set the shard count strategy.
    #[must_use]
    pub fn shards(mut self, shards: ShardCount) -> Self {
        self.shards = shards;
        self
    }

    /// Set the presence sent with identify.
    #[must_use]
    pub fn presence(mut self, presence: PresenceUpdate) -> Self {
        self.presence = Some(presence);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_ms, 1000);
        assert_eq!(config.max_ms, 128_000);
        assert_eq!(config.max_attempts, u32::MAX);
    }

    #[test]
    fn gateway_defaults() {
        let config = GatewayConfig::new(BotToken::new("tok"));
        assert_eq!(config.shards, ShardCount::Exact(1));
        assert_eq!(config.intents, Intents::default());
        assert!(!config.compress);
        assert_eq!(config.hello_timeout, Duration::from_secs(30));
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.disconnect_grace, Duration::from_secs(5));
        assert_eq!(config.event_buffer, DEFAULT_EVENT_CAPACITY);
        assert!(config.presence.is_none());
    }

    #[test]
    fn builder_methods() {
        let config = GatewayConfig::new(BotToken::new("tok"))
            .intents(Intents::ALL)
            .shards(ShardCount::Auto)
            .presence(PresenceUpdate::default());
        assert_eq!(config.intents, Intents::ALL);
        assert_eq!(config.shards, ShardCount::Auto);
        assert!(config.presence.is_some());
    }

    #[test]
    fn shard_count_serde() {
        let auto: ShardCount = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, ShardCount::Auto);
        let exact: ShardCount = serde_json::from_str("{\"exact\":20}").unwrap();
        assert_eq!(exact, ShardCount::Exact(20));
    }
}
