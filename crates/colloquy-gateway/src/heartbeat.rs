//! Heartbeat task and zombie-link detection.
//!
//! Runs as a concurrent task alongside the `WebSocket` reader. Sends
//! periodic heartbeats through the shared writer queue and detects
//! zombie links when ACKs stop arriving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::connection::Outbound;
use crate::protocol;

/// Tracks heartbeat health for zombie-link detection.
#[derive(Debug)]
pub(crate) struct HeartbeatState {
    /// Whether the last heartbeat we sent was acknowledged.
    pub(crate) last_ack_received: bool,
    /// When the last heartbeat was sent.
    pub(crate) last_sent_at: Option<Instant>,
    /// When the last ACK arrived.
    pub(crate) last_ack_at: Option<Instant>,
    /// Measured send→ack latency of the last acknowledged beat.
    pub(crate) latency: Option<Duration>,
}

impl HeartbeatState {
    /// Fresh state: no heartbeat sent yet, so nothing is outstanding.
    pub(crate) fn new() -> Self {
        Self {
            last_ack_received: true,
            last_sent_at: None,
            last_ack_at: None,
            latency: None,
        }
    }

    /// Record that a heartbeat was sent.
    pub(crate) fn beat_sent(&mut self) {
        self.last_ack_received = false;
        self.last_sent_at = Some(Instant::now());
    }

    /// Record that a heartbeat ACK was received.
    pub(crate) fn ack_received(&mut self) {
        let now = Instant::now();
        self.last_ack_received = true;
        self.last_ack_at = Some(now);
        if let Some(sent) = self.last_sent_at {
            self.latency = Some(now.saturating_duration_since(sent));
        }
        trace!(latency = ?self.latency, "heartbeat ACK received");
    }

    /// The zombie invariant: a beat is outstanding and unacknowledged.
    pub(crate) fn is_zombie(&self) -> bool {
        !self.last_ack_received
    }
}

/// Runs the heartbeat loop.
///
/// The first heartbeat is sent after `interval * jitter` with
/// `jitter ∈ [0, 1)` to avoid thundering herds; subsequent beats fire
/// every `interval`. If the previous beat was never acknowledged when
/// the next is due, the link is a zombie and `zombie_tx` fires so the
/// connection loop can close with code 4000 and reconnect.
pub(crate) async fn run_heartbeat(
    interval_ms: u64,
    sequence: Arc<Mutex<Option<u64>>>,
    heartbeat_state: Arc<Mutex<HeartbeatState>>,
    outbound_tx: mpsc::Sender<Outbound>,
    zombie_tx: oneshot::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let jitter = f64::from(fastrand::u32(0..1000)) / 1000.0;
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let first_delay = Duration::from_millis((interval_ms as f64 * jitter) as u64);

    debug!(
        interval_ms,
        first_delay_ms = first_delay.as_millis(),
        "heartbeat task started"
    );

    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => return,
        () = tokio::time::sleep(first_delay) => {},
    }

    if send_heartbeat_if_healthy(&sequence, &heartbeat_state, &outbound_tx)
        .await
        .is_err()
    {
        let _ = zombie_tx.send(());
        return;
    }

    let interval = Duration::from_millis(interval_ms);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("heartbeat task shutting down");
                return;
            }
            () = tokio::time::sleep(interval) => {
                if send_heartbeat_if_healthy(&sequence, &heartbeat_state, &outbound_tx)
                    .await
                    .is_err()
                {
                    warn!("heartbeat ACK missed, zombie link detected");
                    let _ = zombie_tx.send(());
                    return;
                }
            }
        }
    }
}

/// Check ACK status and send a heartbeat if the link is healthy.
///
/// Returns `Err(())` when the previous ACK never arrived (zombie) or
/// the writer queue is gone.
async fn send_heartbeat_if_healthy(
    sequence: &Arc<Mutex<Option<u64>>>,
    heartbeat_state: &Arc<Mutex<HeartbeatState>>,
    outbound_tx: &mpsc::Sender<Outbound>,
) -> Result<(), ()> {
    let mut state = heartbeat_state.lock().await;

    if state.is_zombie() {
        return Err(());
    }

    let seq = *sequence.lock().await;
    debug!(seq = ?seq, "sending heartbeat");
    state.beat_sent();
    drop(state);

    // A closed queue means the writer exited; the outer loop handles
    // reconnection.
    if outbound_tx
        .send(Outbound::Payload(protocol::build_heartbeat(seq)))
        .await
        .is_err()
    {
        return Err(());
    }

    Ok(())
}
