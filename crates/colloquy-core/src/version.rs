//! API version and derived URL helpers.

/// Discord API version every component speaks. Process-wide constant.
pub const API_VERSION: u8 = 10;

/// Base URL for REST requests, version included, with trailing slash.
#[must_use]
pub fn api_base() -> String {
    format!("https://discord.com/api/v{API_VERSION}/")
}

/// Query string appended to gateway WebSocket URLs.
#[must_use]
pub fn gateway_query() -> String {
    format!("?v={API_VERSION}&encoding=json")
}
