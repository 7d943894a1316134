//! `WebSocket` connection management for the gateway.
//!
//! Handles connecting, the split into reader and writer halves, and the
//! writer task that is the sole owner of the transport's send side.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use crate::error::GatewayResult;
use crate::protocol::GatewayPayload;

/// Type alias for the `WebSocket` stream used by the gateway.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of the transport.
pub(crate) type WsReader = SplitStream<WsStream>;

/// Write half of the transport.
pub(crate) type WsWriter = SplitSink<WsStream, Message>;

/// A frame queued for the writer task.
///
/// Heartbeats, identify/resume, and outbound commands all flow through
/// the same queue, so their relative order on the wire is exactly their
/// queue order.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A JSON gateway payload.
    Payload(GatewayPayload),
    /// A close frame; the writer sends it and exits.
    Close(u16),
}

/// A live `WebSocket` connection to the gateway.
pub(crate) struct GatewayConnection {
    writer: WsWriter,
    reader: WsReader,
}

impl GatewayConnection {
    /// Connect to the given gateway URL (`wss://` scheme).
    pub(crate) async fn connect(url: &str) -> GatewayResult<Self> {
        let (ws, _response) = connect_async(url).await?;
        let (writer, reader) = ws.split();
        Ok(Self { writer, reader })
    }

    /// Take the split halves for use with `tokio::select!`.
    pub(crate) fn into_parts(self) -> (WsWriter, WsReader) {
        (self.writer, self.reader)
    }
}

/// Spawn the writer task: drains the outbound queue into the transport.
///
/// The task exits when the queue closes, a close frame is sent, or a
/// send fails.
pub(crate) fn spawn_writer(
    mut writer: WsWriter,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Payload(payload) => {
                    let json = match serde_json::to_string(&payload) {
                        Ok(json) => json,
                        Err(err) => {
                            error!(error = %err, "failed to serialize gateway payload");
                            continue;
                        },
                    };
                    if let Err(err) = writer.send(Message::Text(json.into())).await {
                        debug!(error = %err, "writer task: send failed");
                        return;
                    }
                },
                Outbound::Close(code) => {
                    let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: code.into(),
                        reason: "closing".into(),
                    };
                    if let Err(err) = writer.send(Message::Close(Some(frame))).await {
                        debug!(error = %err, "writer task: close failed");
                    }
                    return;
                },
            }
        }
    })
}
