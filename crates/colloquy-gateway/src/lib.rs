//! Colloquy Gateway - Discord gateway connection layer.
//!
//! A long-lived, self-healing real-time event stream: each shard is a
//! single `WebSocket` connection that identifies, heartbeats, detects
//! zombie links, resumes after disconnects, honors invalid-session
//! rollovers, reconnects with jittered backoff, and shuts down cleanly.
//! A [`Cluster`] coordinates N shards under the gateway's identify
//! concurrency gate and merges their event streams.
//!
//! # Architecture
//!
//! ```text
//! Cluster (coordinator.rs)
//! ├── IdentifyGate — serialize identifies per concurrency bucket
//! └── Shard × N (shard.rs)
//!     ├── runner task — owns the transport, sole writer, reconnects
//!     │   with jittered exponential delays
//!     ├── heartbeat task (heartbeat.rs) — paired timer over a channel
//!     └── EventMultiplexer (events.rs) — broadcast to subscribers
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use colloquy_core::{BotToken, Intents};
//! use colloquy_gateway::{Cluster, GatewayConfig, GatewayEvent, ShardCount};
//!
//! let token = BotToken::from_env("DISCORD_BOT_TOKEN").expect("token");
//! let config = GatewayConfig::new(token)
//!     .intents(Intents::default() | Intents::MESSAGE_CONTENT)
//!     .shards(ShardCount::Auto);
//!
//! let cluster = Cluster::connect(config).await?;
//! let mut events = cluster.events();
//! while let Some(event) = events.recv().await {
//!     if let GatewayEvent::Dispatch { name, data, .. } = event {
//!         println!("{name}: {data}");
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod config;
mod connection;
pub mod coordinator;
pub mod error;
pub mod events;
mod heartbeat;
pub mod protocol;
pub mod shard;

pub use config::{GatewayConfig, ReconnectConfig, ShardCount};
pub use coordinator::Cluster;
pub use error::{GatewayError, GatewayResult};
pub use events::{
    EventMultiplexer, EventStream, GatewayEvent, ParseFailure, ParseFailureStream,
    DEFAULT_EVENT_CAPACITY,
};
pub use protocol::{
    Activity, GatewayBotData, IdentifyProperties, PresenceUpdate, ReadyData,
    RequestGuildMembers, SessionStartLimit, VoiceStateUpdate,
};
pub use shard::{ConnectionState, Shard};
