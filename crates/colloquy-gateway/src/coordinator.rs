//! Sharding coordinator: N shards behind one event stream, with
//! identify-concurrency gating.
//!
//! Discord admits `max_concurrency` identifies in parallel, one per
//! bucket (`shard_id % max_concurrency`), and expects identifies within
//! a bucket to be at least 5 s apart. The [`IdentifyGate`] enforces
//! exactly that; everything else about a shard's lifecycle is the
//! single-shard state machine.

use std::sync::Arc;
use std::time::Duration;

use colloquy_http::endpoint;
use colloquy_http::HttpClient;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, ShardCount};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventMultiplexer, EventStream, ParseFailureStream};
use crate::protocol::{GatewayBotData, PresenceUpdate, RequestGuildMembers, VoiceStateUpdate};
use crate::shard::Shard;

/// Minimum spacing between identifies within one bucket.
const IDENTIFY_SPACING: Duration = Duration::from_secs(5);

// ── Identify gate ────────────────────────────────────────────

/// Serializes identifies within each concurrency bucket and spaces them
/// at least [`IDENTIFY_SPACING`] apart. Buckets are independent, so up
/// to `max_concurrency` identifies proceed in parallel.
#[derive(Debug)]
pub(crate) struct IdentifyGate {
    spacing: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyGate {
    /// A gate with the protocol's 5 s spacing.
    pub(crate) fn new(max_concurrency: u32) -> Self {
        Self::with_spacing(max_concurrency, IDENTIFY_SPACING)
    }

    /// A gate with custom spacing (tests).
    pub(crate) fn with_spacing(max_concurrency: u32, spacing: Duration) -> Self {
        let count = max_concurrency.max(1) as usize;
        Self {
            spacing,
            buckets: (0..count).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Wait for this shard's identify slot.
    ///
    /// Holding the bucket lock across the wait is what serializes
    /// identifies within the bucket.
    pub(crate) async fn acquire(&self, shard_id: u32) {
        let index = (shard_id as usize) % self.buckets.len();
        let mut last = self.buckets[index].lock().await;
        if let Some(previous) = *last {
            let due = previous + self.spacing;
            if due > Instant::now() {
                debug!(shard = shard_id, bucket = index, "waiting for identify slot");
                tokio::time::sleep_until(due).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Number of concurrency buckets.
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// ── Cluster ──────────────────────────────────────────────────

/// A group of shards sharing one event stream.
///
/// A terminal close on one shard surfaces as a
/// [`GatewayEvent::ShardStopped`](crate::events::GatewayEvent::ShardStopped)
/// observation; the remaining shards keep running.
pub struct Cluster {
    shards: Vec<Shard>,
    multiplexer: EventMultiplexer,
    shard_count: u32,
}

impl Cluster {
    /// Resolve the shard count, build the shards, and start them all.
    ///
    /// With [`ShardCount::Auto`] the recommended count and the identify
    /// concurrency come from the gateway-bot discovery endpoint; an
    /// exact count runs with a single identify bucket.
    ///
    /// # Errors
    ///
    /// Fails on a zero shard count, discovery failure, or a rejected
    /// credential (401 from discovery).
    pub async fn connect(config: GatewayConfig) -> GatewayResult<Self> {
        let config = Arc::new(config);
        let http = Arc::new(HttpClient::new(config.token.clone(), config.http.clone())?);

        let (shard_count, max_concurrency) = match config.shards {
            ShardCount::Exact(0) => {
                return Err(GatewayError::Protocol("shard count must be positive".into()));
            },
            ShardCount::Exact(count) => (count, 1),
            ShardCount::Auto => {
                let info = Self::fetch_gateway_bot(&http).await?;
                if info.session_start_limit.remaining < info.shards {
                    warn!(
                        remaining = info.session_start_limit.remaining,
                        needed = info.shards,
                        reset_after_ms = info.session_start_limit.reset_after,
                        "identify budget lower than shard count"
                    );
                }
                (
                    info.shards.max(1),
                    info.session_start_limit.max_concurrency.max(1),
                )
            },
        };

        let gate = Arc::new(IdentifyGate::new(max_concurrency));
        let multiplexer = EventMultiplexer::with_capacity(config.event_buffer);

        let mut shards = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let shard = Shard::with_shared(
                Arc::clone(&config),
                shard_id,
                shard_count,
                multiplexer.clone(),
                Arc::clone(&gate),
                Arc::clone(&http),
            );
            shard.connect().await?;
            shards.push(shard);
        }

        info!(shard_count, max_concurrency, "cluster started");
        Ok(Self {
            shards,
            multiplexer,
            shard_count,
        })
    }

    /// `GET /gateway/bot`: gateway URL, recommended shards, identify
    /// budget.
    async fn fetch_gateway_bot(http: &HttpClient) -> GatewayResult<GatewayBotData> {
        let response = http.send(&endpoint::GATEWAY_BOT, &[], &[], None).await?;
        if response.status == 401 {
            return Err(GatewayError::AuthenticationFailed);
        }
        if !response.is_success() {
            return Err(GatewayError::Protocol(format!(
                "gateway-bot discovery failed with status {}",
                response.status
            )));
        }
        Ok(serde_json::from_value(response.body)?)
    }

    /// Number of shards in the cluster.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// All shards, indexed by shard id.
    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// A single shard by id.
    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<&Shard> {
        self.shards.get(shard_id as usize)
    }

    /// The shard that owns a guild.
    #[must_use]
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<&Shard> {
        let index = colloquy_core::shard_for_guild(guild_id, self.shard_count);
        self.shard(index)
    }

    /// A new subscriber on the merged event stream.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.multiplexer.make_events_stream()
    }

    /// A new subscriber on the merged parse-failure stream.
    #[must_use]
    pub fn parse_failures(&self) -> ParseFailureStream {
        self.multiplexer.make_parse_failures_stream()
    }

    /// Broadcast a presence update to every shard.
    pub async fn update_presence(&self, presence: PresenceUpdate) {
        for shard in &self.shards {
            shard.update_presence(presence.clone()).await;
        }
    }

    /// Route a guild-members request to the shard owning the guild.
    /// Requests for unparseable guild ids are dropped with a warning.
    pub async fn request_guild_members(&self, request: RequestGuildMembers) {
        match Self::route_target(&request.guild_id, self.shard_count) {
            Some(index) => {
                if let Some(shard) = self.shard(index) {
                    shard.request_guild_members(request).await;
                }
            },
            None => {
                warn!(guild_id = %request.guild_id, "unroutable guild id, command dropped");
            },
        }
    }

    /// Route a voice state update to the shard owning the guild.
    pub async fn update_voice_state(&self, update: VoiceStateUpdate) {
        match Self::route_target(&update.guild_id, self.shard_count) {
            Some(index) => {
                if let Some(shard) = self.shard(index) {
                    shard.update_voice_state(update).await;
                }
            },
            None => {
                warn!(guild_id = %update.guild_id, "unroutable guild id, command dropped");
            },
        }
    }

    /// Disconnect every shard, in parallel, waiting for each to finish.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.shards.iter().map(Shard::disconnect)).await;
        info!("cluster shut down");
    }

    /// The shard index owning a stringly-typed guild id.
    fn route_target(guild_id: &str, shard_count: u32) -> Option<u32> {
        let id: u64 = guild_id.parse().ok()?;
        Some(colloquy_core::shard_for_guild(id, shard_count))
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("shard_count", &self.shard_count)
            .finish()
    }
}
