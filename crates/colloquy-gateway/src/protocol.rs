//! Gateway wire protocol: opcodes, close codes, payload types, and
//! payload builders.
//!
//! Implements the JSON encoding of the Discord Gateway protocol (the
//! binary/etf encoding is out of scope). Dispatch event payloads are
//! carried as opaque `serde_json::Value`; only the envelopes and the
//! handful of payloads the state machine itself interprets (Hello,
//! Ready, the gateway-bot discovery response) are modelled.

use colloquy_core::{BotToken, Intents};
use serde::{Deserialize, Serialize};

// ── Opcodes ──────────────────────────────────────────────────

/// Gateway opcodes.
pub mod opcode {
    /// Event dispatch (receive only).
    pub const DISPATCH: u8 = 0;
    /// Heartbeat (bidirectional).
    pub const HEARTBEAT: u8 = 1;
    /// Identify (send only).
    pub const IDENTIFY: u8 = 2;
    /// Presence update (send only).
    pub const PRESENCE_UPDATE: u8 = 3;
    /// Voice state update (send only).
    pub const VOICE_STATE_UPDATE: u8 = 4;
    /// Resume (send only).
    pub const RESUME: u8 = 6;
    /// Server requests reconnect (receive only).
    pub const RECONNECT: u8 = 7;
    /// Request guild members chunk (send only).
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    /// Invalid session (receive only).
    pub const INVALID_SESSION: u8 = 9;
    /// Hello — contains heartbeat interval (receive only).
    pub const HELLO: u8 = 10;
    /// Heartbeat ACK (receive only).
    pub const HEARTBEAT_ACK: u8 = 11;
}

// ── Close codes ──────────────────────────────────────────────

/// Gateway close codes with protocol-defined meanings.
pub mod close_code {
    /// Unknown error.
    pub const UNKNOWN: u16 = 4000;
    /// Unknown opcode sent by us.
    pub const UNKNOWN_OPCODE: u16 = 4001;
    /// Decode error on a payload we sent.
    pub const DECODE_ERROR: u16 = 4002;
    /// Payload sent before identifying.
    pub const NOT_AUTHENTICATED: u16 = 4003;
    /// Authentication failed — bad token.
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    /// Identify sent more than once.
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    /// Invalid resume sequence.
    pub const INVALID_SEQ: u16 = 4006;
    /// Payloads sent too quickly.
    pub const RATE_LIMITED: u16 = 4008;
    /// Session timed out.
    pub const SESSION_TIMEOUT: u16 = 4009;
    /// Invalid shard configuration.
    pub const INVALID_SHARD: u16 = 4010;
    /// Sharding required for this bot.
    pub const SHARDING_REQUIRED: u16 = 4011;
    /// Invalid API version.
    pub const INVALID_API_VERSION: u16 = 4012;
    /// Invalid intents value.
    pub const INVALID_INTENTS: u16 = 4013;
    /// Disallowed intents (not enabled in the developer portal).
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

/// What the connection loop should do about a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect, resuming the session when one is held.
    Resume,
    /// Reconnect with a fresh identify (session discarded).
    Reidentify,
    /// We sent payloads too fast; reconnect after a delay.
    ReconnectDelayed,
    /// Do not reconnect.
    Terminal,
}

/// Classify a close code into the action the loop must take.
///
/// `1000`/`1001` and the transient 4xxx family reconnect (resuming when
/// possible); `4006` (invalid resume sequence) and `4009` (session
/// timeout) force a fresh identify; `4008` reconnects after a delay;
/// `4004` and `4010`–`4014` are terminal. Unknown codes are treated as
/// transient.
#[must_use]
pub fn close_action(code: u16) -> CloseAction {
    match code {
        close_code::AUTHENTICATION_FAILED
        | close_code::INVALID_SHARD
        | close_code::SHARDING_REQUIRED
        | close_code::INVALID_API_VERSION
        | close_code::INVALID_INTENTS
        | close_code::DISALLOWED_INTENTS => CloseAction::Terminal,
        close_code::INVALID_SEQ | close_code::SESSION_TIMEOUT => CloseAction::Reidentify,
        close_code::RATE_LIMITED => CloseAction::ReconnectDelayed,
        _ => CloseAction::Resume,
    }
}

/// Protocol name of a close code, as used in diagnostics.
#[must_use]
pub fn close_code_name(code: u16) -> &'static str {
    match code {
        close_code::UNKNOWN => "unknownError",
        close_code::UNKNOWN_OPCODE => "unknownOpcode",
        close_code::DECODE_ERROR => "decodeError",
        close_code::NOT_AUTHENTICATED => "notAuthenticated",
        close_code::AUTHENTICATION_FAILED => "authenticationFailed",
        close_code::ALREADY_AUTHENTICATED => "alreadyAuthenticated",
        close_code::INVALID_SEQ => "invalidSeq",
        close_code::RATE_LIMITED => "rateLimited",
        close_code::SESSION_TIMEOUT => "sessionTimeout",
        close_code::INVALID_SHARD => "invalidShard",
        close_code::SHARDING_REQUIRED => "shardingRequired",
        close_code::INVALID_API_VERSION => "invalidApiVersion",
        close_code::INVALID_INTENTS => "invalidIntents",
        close_code::DISALLOWED_INTENTS => "disallowedIntents",
        _ => "unknown",
    }
}

/// Issue tracker pointed to by the authentication-failure diagnostic.
pub(crate) const ISSUES_URL: &str = "https://github.com/colloquy-rs/colloquy/issues";

/// The single critical line emitted when the gateway closes with
/// `authenticationFailed`.
#[must_use]
pub(crate) fn auth_failure_message() -> String {
    format!(
        "Will not reconnect because Discord does not allow it. Something is wrong. \
         Your close code is 'authenticationFailed', check Discord docs at \
         https://discord.com/developers/docs/topics/opcodes-and-status-codes\
         #gateway-gateway-close-event-codes and see what it means. \
         Report at {ISSUES_URL} if you think this is a library issue"
    )
}

// ── Wire types ───────────────────────────────────────────────

/// Raw gateway envelope as received/sent over the `WebSocket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode.
    pub op: u8,
    /// Opcode-dependent data.
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    /// Sequence number (dispatch events only).
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name (dispatch events only).
    #[serde(default)]
    pub t: Option<String>,
}

/// Hello payload (`op=10`).
#[derive(Debug, Deserialize)]
pub struct HelloData {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// Ready event data (`t="READY"`).
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyData {
    /// Gateway protocol version the server settled on.
    pub v: u8,
    /// Session ID for resuming.
    pub session_id: String,
    /// Preferred resume gateway URL.
    pub resume_gateway_url: String,
    /// The bot user.
    pub user: ReadyUser,
    /// The application the bot belongs to.
    #[serde(default)]
    pub application: Option<ReadyApplication>,
}

/// User object inside the Ready event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    /// The bot's user ID.
    pub id: String,
    /// `true` for bot users.
    #[serde(default)]
    pub bot: bool,
}

/// Application object inside the Ready event.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyApplication {
    /// Application ID.
    pub id: String,
}

/// Response body of `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBotData {
    /// Gateway `WebSocket` URL.
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    /// Identify budget for this bot.
    pub session_start_limit: SessionStartLimit,
}

/// Session-start budget from `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    /// Total identifies allowed per window.
    pub total: u32,
    /// Identifies remaining in the current window.
    pub remaining: u32,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
    /// Number of identify buckets that may run concurrently.
    pub max_concurrency: u32,
}

// ── Outbound command payloads ────────────────────────────────

/// Presence sent with identify or an `op=3` update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Unix milliseconds when the bot went idle, if it did.
    pub since: Option<u64>,
    /// Displayed activities.
    #[serde(default)]
    pub activities: Vec<Activity>,
    /// `online`, `dnd`, `idle`, `invisible`, or `offline`.
    pub status: String,
    /// Whether the bot is AFK.
    pub afk: bool,
}

impl Default for PresenceUpdate {
    fn default() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: "online".to_string(),
            afk: false,
        }
    }
}

/// A displayed activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Activity text.
    pub name: String,
    /// Activity type (0 = playing, 2 = listening, 3 = watching, ...).
    #[serde(rename = "type")]
    pub kind: u8,
}

/// `op=8` request for guild member chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    /// Guild to request members for.
    pub guild_id: String,
    /// Username prefix filter; empty string matches all.
    #[serde(default)]
    pub query: String,
    /// Maximum members to return; 0 for all (requires empty query).
    pub limit: u32,
    /// Whether to include presences.
    #[serde(default)]
    pub presences: bool,
    /// Nonce echoed back in the chunk dispatches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// `op=4` voice state update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    /// Guild whose voice state changes.
    pub guild_id: String,
    /// Channel to join, or `None` to disconnect.
    pub channel_id: Option<String>,
    /// Whether the bot is muted.
    pub self_mute: bool,
    /// Whether the bot is deafened.
    pub self_deaf: bool,
}

// ── Payload builders ─────────────────────────────────────────

/// Identify connection properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// Operating system name.
    pub os: String,
    /// Library name reported as the browser.
    pub browser: String,
    /// Library name reported as the device.
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "colloquy".to_string(),
            device: "colloquy".to_string(),
        }
    }
}

/// Everything that goes into an identify payload.
#[derive(Debug)]
pub(crate) struct IdentifyFields<'a> {
    pub(crate) token: &'a BotToken,
    pub(crate) intents: Intents,
    pub(crate) properties: &'a IdentifyProperties,
    pub(crate) shard_id: u32,
    pub(crate) shard_count: u32,
    pub(crate) presence: Option<&'a PresenceUpdate>,
    pub(crate) compress: bool,
    pub(crate) large_threshold: Option<u16>,
}

/// Largest `large_threshold` the protocol accepts.
const MAX_LARGE_THRESHOLD: u16 = 250;

/// Build an Identify payload (`op=2`).
pub(crate) fn build_identify(fields: &IdentifyFields<'_>) -> GatewayPayload {
    let mut d = serde_json::json!({
        "token": fields.token.expose(),
        "intents": fields.intents.bits(),
        "properties": fields.properties,
        "compress": fields.compress,
        "shard": [fields.shard_id, fields.shard_count],
    });
    if let Some(threshold) = fields.large_threshold {
        d["large_threshold"] = serde_json::Value::from(threshold.min(MAX_LARGE_THRESHOLD));
    }
    if let Some(presence) = fields.presence {
        if let Ok(value) = serde_json::to_value(presence) {
            d["presence"] = value;
        }
    }
    GatewayPayload {
        op: opcode::IDENTIFY,
        d: Some(d),
        s: None,
        t: None,
    }
}

/// Build a Resume payload (`op=6`).
pub(crate) fn build_resume(token: &BotToken, session_id: &str, sequence: u64) -> GatewayPayload {
    GatewayPayload {
        op: opcode::RESUME,
        d: Some(serde_json::json!({
            "token": token.expose(),
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

/// Build a Heartbeat payload (`op=1`).
pub(crate) fn build_heartbeat(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: opcode::HEARTBEAT,
        d: sequence.map(serde_json::Value::from),
        s: None,
        t: None,
    }
}

/// Build a command payload for one of the outbound ops (3, 4, 8).
pub(crate) fn build_command<T: Serialize>(op: u8, data: &T) -> Option<GatewayPayload> {
    let d = serde_json::to_value(data).ok()?;
    Some(GatewayPayload {
        op,
        d: Some(d),
        s: None,
        t: None,
    })
}

// ── Resume URL validation ────────────────────────────────────

/// Allowed resume gateway URL domains.
const ALLOWED_RESUME_DOMAINS: &[&str] = &["discord.gg"];

/// Validate that a resume gateway URL is `wss://` on an allowed domain.
#[must_use]
pub fn is_valid_resume_url(url: &str) -> bool {
    let Some(host_part) = url.strip_prefix("wss://") else {
        return false;
    };
    let host = host_part.split(['/', '?']).next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    ALLOWED_RESUME_DOMAINS
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}
