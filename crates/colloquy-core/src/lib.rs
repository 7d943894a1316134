//! Colloquy Core - Shared primitives for the colloquy Discord client.
//!
//! This crate holds the small set of types every other colloquy crate
//! agrees on:
//! - [`BotToken`] — the bot credential, wrapped so it cannot leak into
//!   logs or serialized output
//! - [`Intents`] — the gateway intent bitset
//! - [`API_VERSION`] and the derived REST/gateway URL helpers
//! - Snowflake helpers ([`shard_for_guild`]) for routing commands to the
//!   shard that owns a guild
//!
//! # Architecture
//!
//! ```text
//! colloquy-gateway (connection layer)
//! ├── colloquy-http (request layer)
//! └── colloquy-core (primitives)   ← you are here
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod intents;
pub mod snowflake;
pub mod token;
pub mod version;

pub use intents::Intents;
pub use snowflake::shard_for_guild;
pub use token::BotToken;
pub use version::{api_base, gateway_query, API_VERSION};
