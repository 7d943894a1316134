//! Endpoint descriptors consumed by the client core.
//!
//! The full generated REST catalog lives outside this crate; the client
//! only needs the contract: a URL template with named parameters, a
//! method, and the auth/rate-limit/cache attributes. The handful of
//! endpoints the core itself depends on (gateway discovery and a few
//! representative catalog entries) are defined as constants here.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::error::{HttpError, HttpResult};

/// Characters percent-encoded inside a URL path segment.
///
/// The URL-path-allowed set: controls, space, and the characters that
/// would change the structure of the path or query.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

/// HTTP method of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl Method {
    /// Uppercase method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}

/// Collapses per-instance endpoints to a single cache (and rate-limit)
/// identity, so `getChannel(1)` and `getChannel(2)` share configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CacheIdentity {
    /// Gateway URL discovery.
    Gateway,
    /// Gateway URL discovery with bot metadata (shards, concurrency).
    GatewayBot,
    /// Channel lookup.
    GetChannel,
    /// Guild lookup.
    GetGuild,
    /// User lookup.
    GetUser,
    /// The bot's own user.
    GetCurrentUser,
}

/// A REST endpoint descriptor.
///
/// Descriptors are compile-time constants; path parameters are supplied
/// at call time and interpolated into `url_template`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Stable identifier; also the key for lazy bucket discovery.
    pub id: &'static str,
    /// Path template relative to the API base, e.g.
    /// `channels/{channel_id}/messages`.
    pub url_template: &'static str,
    /// HTTP method.
    pub method: Method,
    /// `false` only for webhook-token endpoints, which authenticate via
    /// the token embedded in the path.
    pub requires_auth: bool,
    /// `false` for interaction callbacks, which Discord exempts from the
    /// global limit.
    pub counts_against_global_limit: bool,
    /// Present when responses for this endpoint may be cached.
    pub cacheable_identity: Option<CacheIdentity>,
}

/// Path parameters whose values are secrets and must be hashed out of
/// log identifiers.
const SENSITIVE_PARAMS: &[&str] = &["webhook_token", "interaction_token"];

impl Endpoint {
    /// Interpolate path parameters into the template, percent-encoding
    /// each value over the path-allowed set.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::MissingPathParam`] when the template names a
    /// parameter that `params` does not supply.
    pub fn render_path(&self, params: &[(&str, &str)]) -> HttpResult<String> {
        self.interpolate(params, |_, value| {
            utf8_percent_encode(value, PATH_SEGMENT).to_string()
        })
    }

    /// The log-safe identifier for this request.
    ///
    /// Identical to the rendered path except that sensitive parameters
    /// (webhook and interaction tokens) are replaced by a short hash, so
    /// request logs never carry a usable secret.
    #[must_use]
    pub fn url_description(&self, params: &[(&str, &str)]) -> String {
        self.interpolate(params, |name, value| {
            if SENSITIVE_PARAMS.contains(&name) {
                format!("hashed({:016x})", hash_str(value))
            } else {
                value.to_string()
            }
        })
        .unwrap_or_else(|_| self.url_template.to_string())
    }

    fn interpolate<F>(&self, params: &[(&str, &str)], encode: F) -> HttpResult<String>
    where
        F: Fn(&str, &str) -> String,
    {
        let mut out = String::with_capacity(self.url_template.len());
        let mut rest = self.url_template;

        while let Some(start) = rest.find('{') {
            let (head, tail) = rest.split_at(start);
            out.push_str(head);
            let end = tail.find('}').ok_or_else(|| HttpError::InvalidUrl(format!(
                "unterminated placeholder in template '{}'",
                self.url_template
            )))?;
            let name = &tail[1..end];
            let value = params
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| HttpError::MissingPathParam {
                    name: name.to_string(),
                    endpoint: self.id,
                })?;
            out.push_str(&encode(name, value));
            rest = &tail[end.saturating_add(1)..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Stable 64-bit FNV-1a hash for log identifiers.
fn hash_str(value: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in value.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// ── Endpoints the core itself consumes ───────────────────────

/// `GET /gateway` — unauthenticated gateway URL discovery.
pub const GATEWAY: Endpoint = Endpoint {
    id: "get_gateway",
    url_template: "gateway",
    method: Method::Get,
    requires_auth: false,
    counts_against_global_limit: true,
    cacheable_identity: Some(CacheIdentity::Gateway),
};

/// `GET /gateway/bot` — gateway URL plus recommended shard count,
/// session-start limit, and the identify `max_concurrency`.
pub const GATEWAY_BOT: Endpoint = Endpoint {
    id: "get_gateway_bot",
    url_template: "gateway/bot",
    method: Method::Get,
    requires_auth: true,
    counts_against_global_limit: true,
    cacheable_identity: Some(CacheIdentity::GatewayBot),
};

/// `GET /channels/{channel_id}`.
pub const GET_CHANNEL: Endpoint = Endpoint {
    id: "get_channel",
    url_template: "channels/{channel_id}",
    method: Method::Get,
    requires_auth: true,
    counts_against_global_limit: true,
    cacheable_identity: Some(CacheIdentity::GetChannel),
};

/// `POST /channels/{channel_id}/messages`.
pub const CREATE_MESSAGE: Endpoint = Endpoint {
    id: "create_message",
    url_template: "channels/{channel_id}/messages",
    method: Method::Post,
    requires_auth: true,
    counts_against_global_limit: true,
    cacheable_identity: None,
};

/// `GET /users/@me`.
pub const GET_CURRENT_USER: Endpoint = Endpoint {
    id: "get_current_user",
    url_template: "users/@me",
    method: Method::Get,
    requires_auth: true,
    counts_against_global_limit: true,
    cacheable_identity: Some(CacheIdentity::GetCurrentUser),
};

/// `POST /webhooks/{webhook_id}/{webhook_token}` — authenticates via the
/// token in the path, not the bot credential.
pub const EXECUTE_WEBHOOK: Endpoint = Endpoint {
    id: "execute_webhook",
    url_template: "webhooks/{webhook_id}/{webhook_token}",
    method: Method::Post,
    requires_auth: false,
    counts_against_global_limit: true,
    cacheable_identity: None,
};

/// `POST /interactions/{interaction_id}/{interaction_token}/callback` —
/// exempt from the global rate limit.
pub const INTERACTION_CALLBACK: Endpoint = Endpoint {
    id: "interaction_callback",
    url_template: "interactions/{interaction_id}/{interaction_token}/callback",
    method: Method::Post,
    requires_auth: false,
    counts_against_global_limit: false,
    cacheable_identity: None,
};
