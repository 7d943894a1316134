//! Gateway intent bitset.
//!
//! Intents control which dispatch event families the gateway delivers.
//! Privileged intents (`GUILD_MEMBERS`, `GUILD_PRESENCES`,
//! `MESSAGE_CONTENT`) must additionally be enabled in the Discord
//! Developer Portal; requesting them without portal approval closes the
//! connection with code 4014.

use serde::{Deserialize, Serialize};

/// Gateway intent bitset.
///
/// Combine flags with `|`:
///
/// ```
/// use colloquy_core::Intents;
///
/// let intents = Intents::GUILDS | Intents::GUILD_MESSAGES;
/// assert!(intents.contains(Intents::GUILDS));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Intents(u64);

impl Intents {
    /// Guild create/update/delete, channels, threads, roles.
    pub const GUILDS: Self = Self(1 << 0);
    /// Member add/update/remove. Privileged.
    pub const GUILD_MEMBERS: Self = Self(1 << 1);
    /// Bans and audit-log-adjacent moderation events.
    pub const GUILD_MODERATION: Self = Self(1 << 2);
    /// Emoji, sticker, and soundboard updates.
    pub const GUILD_EXPRESSIONS: Self = Self(1 << 3);
    /// Integration updates.
    pub const GUILD_INTEGRATIONS: Self = Self(1 << 4);
    /// Webhook updates.
    pub const GUILD_WEBHOOKS: Self = Self(1 << 5);
    /// Invite create/delete.
    pub const GUILD_INVITES: Self = Self(1 << 6);
    /// Voice state updates.
    pub const GUILD_VOICE_STATES: Self = Self(1 << 7);
    /// Presence updates. Privileged.
    pub const GUILD_PRESENCES: Self = Self(1 << 8);
    /// Messages in guild channels.
    pub const GUILD_MESSAGES: Self = Self(1 << 9);
    /// Reactions in guild channels.
    pub const GUILD_MESSAGE_REACTIONS: Self = Self(1 << 10);
    /// Typing indicators in guild channels.
    pub const GUILD_MESSAGE_TYPING: Self = Self(1 << 11);
    /// Messages in DMs.
    pub const DIRECT_MESSAGES: Self = Self(1 << 12);
    /// Reactions in DMs.
    pub const DIRECT_MESSAGE_REACTIONS: Self = Self(1 << 13);
    /// Typing indicators in DMs.
    pub const DIRECT_MESSAGE_TYPING: Self = Self(1 << 14);
    /// Message content fields on dispatches. Privileged.
    pub const MESSAGE_CONTENT: Self = Self(1 << 15);
    /// Scheduled event updates.
    pub const GUILD_SCHEDULED_EVENTS: Self = Self(1 << 16);
    /// Auto-moderation rule configuration.
    pub const AUTO_MODERATION_CONFIGURATION: Self = Self(1 << 20);
    /// Auto-moderation rule executions.
    pub const AUTO_MODERATION_EXECUTION: Self = Self(1 << 21);
    /// Poll votes in guild channels.
    pub const GUILD_MESSAGE_POLLS: Self = Self(1 << 24);
    /// Poll votes in DMs.
    pub const DIRECT_MESSAGE_POLLS: Self = Self(1 << 25);

    /// No intents.
    pub const NONE: Self = Self(0);

    /// Every documented intent, privileged ones included.
    pub const ALL: Self = Self(
        Self::GUILDS.0
            | Self::GUILD_MEMBERS.0
            | Self::GUILD_MODERATION.0
            | Self::GUILD_EXPRESSIONS.0
            | Self::GUILD_INTEGRATIONS.0
            | Self::GUILD_WEBHOOKS.0
            | Self::GUILD_INVITES.0
            | Self::GUILD_VOICE_STATES.0
            | Self::GUILD_PRESENCES.0
            | Self::GUILD_MESSAGES.0
            | Self::GUILD_MESSAGE_REACTIONS.0
            | Self::GUILD_MESSAGE_TYPING.0
            | Self::DIRECT_MESSAGES.0
            | Self::DIRECT_MESSAGE_REACTIONS.0
            | Self::DIRECT_MESSAGE_TYPING.0
            | Self::MESSAGE_CONTENT.0
            | Self::GUILD_SCHEDULED_EVENTS.0
            | Self::AUTO_MODERATION_CONFIGURATION.0
            | Self::AUTO_MODERATION_EXECUTION.0
            | Self::GUILD_MESSAGE_POLLS.0
            | Self::DIRECT_MESSAGE_POLLS.0,
    );

    /// Construct from a raw bitmask.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw bitmask as sent in the identify payload.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// `true` if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `true` if no intents are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Default intents: guilds plus guild and direct messages.
///
/// `MESSAGE_CONTENT` is not included — it is privileged and must be
/// opted into explicitly.
impl Default for Intents {
    fn default() -> Self {
        Self::GUILDS | Self::GUILD_MESSAGES | Self::DIRECT_MESSAGES
    }
}

impl std::ops::BitOr for Intents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Intents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
