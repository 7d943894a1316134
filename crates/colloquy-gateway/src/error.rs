//! Error types for the gateway connection layer.

/// Errors produced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// HTTP error during gateway URL discovery.
    #[error("HTTP error during gateway discovery: {0}")]
    Http(#[from] colloquy_http::HttpError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection closed with a close code before the handshake settled.
    #[error("connection closed with code {0}")]
    Closed(u16),

    /// Authentication failed (close code 4004). Terminal.
    #[error("authentication failed (close code 4004)")]
    AuthenticationFailed,

    /// Invalid or disallowed intents (close code 4013 or 4014). Terminal.
    #[error("invalid intents configuration (close code {0})")]
    InvalidIntents(u16),

    /// Other non-recoverable close code (4010–4012). Terminal.
    #[error("unrecoverable close code {0}")]
    UnrecoverableClose(u16),

    /// The gateway did not send Hello in time.
    #[error("timed out waiting for Hello")]
    HelloTimeout,

    /// Identify was not acknowledged with Ready in time.
    #[error("timed out waiting for Ready after identify")]
    ReadyTimeout,

    /// The reconnect attempt budget is spent.
    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    /// Protocol violation from the gateway.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl GatewayError {
    /// `true` for errors that forbid reconnecting.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidIntents(_)
                | Self::UnrecoverableClose(_)
                | Self::ReconnectExhausted(_)
        )
    }

    /// The close code carried by this error, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthenticationFailed => Some(4004),
            Self::InvalidIntents(code) | Self::UnrecoverableClose(code) | Self::Closed(code) => {
                Some(*code)
            },
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
