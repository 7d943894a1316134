//! Redacting wrapper for the bot credential.
//!
//! The token is the one value that must never appear in logs, `Debug`
//! dumps, or serialized config. [`BotToken`] redacts all of those paths;
//! the raw value is only reachable through [`BotToken::expose`].

use serde::{Deserialize, Serialize};

/// Placeholder emitted wherever a token would otherwise be printed.
const REDACTED: &str = "<redacted>";

/// A Discord bot token.
///
/// `Debug`, `Display`, and `Serialize` all emit a redaction marker
/// instead of the credential. Use [`BotToken::authorization`] to build
/// the `Authorization` header value and [`BotToken::expose`] where the
/// raw value must cross a wire (identify/resume payloads).
#[derive(Clone, PartialEq, Eq)]
pub struct BotToken(String);

impl BotToken {
    /// Wrap a raw token string.
    ///
    /// Leading/trailing whitespace and a leading `Bot ` prefix are
    /// stripped so the stored value is always the bare credential.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix("Bot ").unwrap_or(trimmed);
        Self(bare.to_string())
    }

    /// Read the token from an environment variable.
    ///
    /// Returns `None` when the variable is unset or empty.
    #[must_use]
    pub fn from_env(var: &str) -> Option<Self> {
        let value = std::env::var(var).ok()?;
        if value.trim().is_empty() {
            return None;
        }
        Some(Self::new(value))
    }

    /// The raw credential. Keep the returned slice away from log lines.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The `Authorization` header value: `Bot <token>`.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("Bot {}", self.0)
    }

    /// `true` if the wrapped credential is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A stable non-reversible fingerprint of the token, used as the key
    /// for process-wide per-token state (rate limiter, cache).
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl std::fmt::Debug for BotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BotToken").field(&REDACTED).finish()
    }
}

impl std::fmt::Display for BotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Serializes the redaction marker, never the credential.
impl Serialize for BotToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Deserializes from a plain string (config files supply the raw token).
impl<'de> Deserialize<'de> for BotToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}
