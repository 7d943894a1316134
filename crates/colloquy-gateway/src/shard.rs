//! Single-shard gateway state machine.
//!
//! A [`Shard`] is a handle; the connection itself runs as one actor
//! task ([`ShardRunner`]) that exclusively owns the transport. Commands
//! reach the runner over a channel, the heartbeat is a paired timer
//! task feeding the same writer queue, and decoded events fan out
//! through the [`EventMultiplexer`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected → Connecting → AwaitingHello → Identifying | Resuming
//!      ↑                                            │
//!      └──────────── reconnect backoff ←── Connected ┘
//!                                              │
//!                                  Closing → Disconnected
//!                                  terminal close → Stopped
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use colloquy_http::endpoint;
use colloquy_http::HttpClient;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

use crate::config::GatewayConfig;
use crate::connection::{spawn_writer, GatewayConnection, Outbound, WsReader};
use crate::coordinator::IdentifyGate;
use crate::error::{GatewayError, GatewayResult};
use crate::events::{EventMultiplexer, EventStream, GatewayEvent, ParseFailure, ParseFailureStream};
use crate::heartbeat::{self, HeartbeatState};
use crate::protocol::{
    self, close_code, opcode, CloseAction, GatewayPayload, HelloData, IdentifyFields, PresenceUpdate,
    ReadyData, RequestGuildMembers, VoiceStateUpdate,
};

/// Close code sent when we abandon a zombie link.
const ZOMBIE_CLOSE_CODE: u16 = 4000;

/// How long the writer queue may drain during teardown.
const WRITER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Depth of the outbound writer queue.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Depth of the handle→runner command queue.
const COMMAND_QUEUE_DEPTH: usize = 16;

// ── Connection state ─────────────────────────────────────────

/// Lifecycle state of a gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// No transport; may connect or reconnect.
    Disconnected = 0,
    /// Opening the transport.
    Connecting = 1,
    /// Transport open, waiting for Hello.
    AwaitingHello = 2,
    /// Identify sent, waiting for Ready.
    Identifying = 3,
    /// Resume sent, waiting for Resumed.
    Resuming = 4,
    /// Steady state; events flow.
    Connected = 5,
    /// Graceful shutdown in progress.
    Closing = 6,
    /// Terminal: reconnecting is forbidden.
    Stopped = 7,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::AwaitingHello,
            3 => Self::Identifying,
            4 => Self::Resuming,
            5 => Self::Connected,
            6 => Self::Closing,
            7 => Self::Stopped,
            _ => Self::Disconnected,
        }
    }
}

/// State shared between the handle and the runner.
#[derive(Debug)]
struct ShardShared {
    state: AtomicU8,
    connection_id: AtomicU64,
}

impl ShardShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            connection_id: AtomicU64::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Acquire)
    }

    fn bump_connection_id(&self) -> u64 {
        self.connection_id
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }
}

// ── Commands ─────────────────────────────────────────────────

/// Commands from the handle to the runner.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Send an `op=3` presence update.
    UpdatePresence(PresenceUpdate),
    /// Send an `op=8` guild members request.
    RequestGuildMembers(RequestGuildMembers),
    /// Send an `op=4` voice state update.
    UpdateVoiceState(VoiceStateUpdate),
    /// Gracefully close; the ack fires when teardown completes.
    Disconnect(oneshot::Sender<()>),
}

// ── Session state ────────────────────────────────────────────

/// Resume material persisted across reconnections.
#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<u64>,
}

impl SessionState {
    fn clear(&mut self) {
        self.session_id = None;
        self.resume_gateway_url = None;
    }

    fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.resume_gateway_url.is_some()
    }
}

// ── Loop actions ─────────────────────────────────────────────

/// What the outer reconnection loop does next.
#[derive(Debug)]
enum LoopAction {
    /// Graceful shutdown; the runner exits.
    Shutdown,
    /// Tear down and reconnect.
    Reconnect {
        /// Discard the session (forces a fresh identify).
        clear_session: bool,
        /// Which delay to apply before reconnecting.
        delay: ReconnectDelay,
    },
}

/// Delay flavor before a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectDelay {
    /// Exponential backoff with full jitter.
    Backoff,
    /// The 1–5 s random wait mandated after an invalid session.
    SessionJitter,
}

impl LoopAction {
    fn reconnect() -> Self {
        Self::Reconnect {
            clear_session: false,
            delay: ReconnectDelay::Backoff,
        }
    }

    fn reidentify() -> Self {
        Self::Reconnect {
            clear_session: true,
            delay: ReconnectDelay::Backoff,
        }
    }
}

/// Map a terminal-capable close code onto an error.
fn close_error(code: u16) -> GatewayError {
    match code {
        close_code::AUTHENTICATION_FAILED => GatewayError::AuthenticationFailed,
        close_code::INVALID_INTENTS | close_code::DISALLOWED_INTENTS => {
            GatewayError::InvalidIntents(code)
        },
        close_code::INVALID_SHARD
        | close_code::SHARDING_REQUIRED
        | close_code::INVALID_API_VERSION => GatewayError::UnrecoverableClose(code),
        _ => GatewayError::Closed(code),
    }
}

// ── Handle ───────────────────────────────────────────────────

enum RunnerSlot {
    Pending(Box<ShardRunner>),
    Running(tokio::task::JoinHandle<()>),
    Done,
}

/// Handle to one gateway connection.
///
/// Constructed standalone via [`Shard::new`] or as a member of a
/// cluster. Dropping the handle asks the runner to shut down.
pub struct Shard {
    shard_id: u32,
    shard_count: u32,
    shared: Arc<ShardShared>,
    command_tx: mpsc::Sender<ShardCommand>,
    multiplexer: EventMultiplexer,
    runner: StdMutex<RunnerSlot>,
    disconnect_grace: Duration,
}

impl Shard {
    /// Create a standalone shard with its own event multiplexer.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client used for gateway discovery cannot be
    /// built.
    pub fn new(config: GatewayConfig, shard_id: u32, shard_count: u32) -> GatewayResult<Self> {
        let http = Arc::new(HttpClient::new(config.token.clone(), config.http.clone())?);
        let multiplexer = EventMultiplexer::with_capacity(config.event_buffer);
        let gate = Arc::new(IdentifyGate::new(1));
        Ok(Self::with_shared(
            Arc::new(config),
            shard_id,
            shard_count,
            multiplexer,
            gate,
            http,
        ))
    }

    /// Create a shard wired into shared cluster infrastructure.
    pub(crate) fn with_shared(
        config: Arc<GatewayConfig>,
        shard_id: u32,
        shard_count: u32,
        multiplexer: EventMultiplexer,
        gate: Arc<IdentifyGate>,
        http: Arc<HttpClient>,
    ) -> Self {
        let shared = Arc::new(ShardShared::new());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let disconnect_grace = config.disconnect_grace;
        let runner = ShardRunner {
            config,
            shard_id,
            shard_count,
            shared: Arc::clone(&shared),
            session: SessionState::default(),
            multiplexer: multiplexer.clone(),
            gate,
            http,
            command_rx,
            pending_disconnects: Vec::new(),
        };
        Self {
            shard_id,
            shard_count,
            shared,
            command_tx,
            multiplexer,
            runner: StdMutex::new(RunnerSlot::Pending(Box::new(runner))),
            disconnect_grace,
        }
    }

    /// This shard's index.
    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Total shard count this shard identifies with.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Monotonic connection counter. Bumps when a transport opens and
    /// once more when the shard finally stops, so observers can witness
    /// both reconnects and shutdown.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.shared.connection_id()
    }

    /// A new subscriber on the event stream.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.multiplexer.make_events_stream()
    }

    /// A new subscriber on the parse-failure stream.
    #[must_use]
    pub fn parse_failures(&self) -> ParseFailureStream {
        self.multiplexer.make_parse_failures_stream()
    }

    /// Start the connection task.
    ///
    /// Events (beginning with `Ready`) arrive on [`Shard::events`].
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the shard was already started.
    pub async fn connect(&self) -> GatewayResult<()> {
        let mut slot = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, RunnerSlot::Done) {
            RunnerSlot::Pending(runner) => {
                let handle = tokio::spawn(runner.run());
                *slot = RunnerSlot::Running(handle);
                Ok(())
            },
            other => {
                *slot = other;
                Err(GatewayError::Protocol("shard already started".into()))
            },
        }
    }

    /// Send an `op=3` presence update. Dropped silently unless the
    /// shard is connected.
    pub async fn update_presence(&self, presence: PresenceUpdate) {
        let _ = self
            .command_tx
            .send(ShardCommand::UpdatePresence(presence))
            .await;
    }

    /// Send an `op=8` guild members request. Dropped silently unless
    /// the shard is connected.
    pub async fn request_guild_members(&self, request: RequestGuildMembers) {
        let _ = self
            .command_tx
            .send(ShardCommand::RequestGuildMembers(request))
            .await;
    }

    /// Send an `op=4` voice state update. Dropped silently unless the
    /// shard is connected.
    pub async fn update_voice_state(&self, update: VoiceStateUpdate) {
        let _ = self
            .command_tx
            .send(ShardCommand::UpdateVoiceState(update))
            .await;
    }

    /// Gracefully disconnect: close frame, cancelled timers, bumped
    /// connection id. Idempotent; failures are suppressed. If teardown
    /// outlives the grace period the runner is aborted outright.
    pub async fn disconnect(&self) {
        {
            let slot = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*slot, RunnerSlot::Running(_)) {
                return;
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ShardCommand::Disconnect(ack_tx))
            .await
            .is_err()
        {
            // Runner already exited.
            return;
        }

        if tokio::time::timeout(self.disconnect_grace, ack_rx)
            .await
            .is_err()
        {
            warn!(
                shard = self.shard_id,
                "disconnect grace expired, aborting runner"
            );
            let mut slot = self.runner.lock().unwrap_or_else(PoisonError::into_inner);
            if let RunnerSlot::Running(handle) = std::mem::replace(&mut *slot, RunnerSlot::Done) {
                handle.abort();
            }
            self.shared.set_state(ConnectionState::Disconnected);
            self.shared.bump_connection_id();
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .field("state", &self.state())
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

// ── Runner ───────────────────────────────────────────────────

/// The actor that owns the transport.
struct ShardRunner {
    config: Arc<GatewayConfig>,
    shard_id: u32,
    shard_count: u32,
    shared: Arc<ShardShared>,
    session: SessionState,
    multiplexer: EventMultiplexer,
    gate: Arc<IdentifyGate>,
    http: Arc<HttpClient>,
    command_rx: mpsc::Receiver<ShardCommand>,
    pending_disconnects: Vec<oneshot::Sender<()>>,
}

impl ShardRunner {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let outcome = self.connect_once(&mut attempt).await;
            match outcome {
                Ok(LoopAction::Shutdown) => {
                    info!(shard = self.shard_id, "shard shut down");
                    self.finish(ConnectionState::Disconnected, None);
                    return;
                },
                Ok(LoopAction::Reconnect {
                    clear_session,
                    delay,
                }) => {
                    if clear_session {
                        self.session.clear();
                    }
                    if !self.reconnect_pause(&mut attempt, delay).await {
                        return;
                    }
                },
                Err(err) if err.is_terminal() => {
                    if matches!(err, GatewayError::AuthenticationFailed) {
                        error!("{}", protocol::auth_failure_message());
                    } else {
                        error!(shard = self.shard_id, error = %err, "fatal gateway error");
                    }
                    self.finish(ConnectionState::Stopped, err.close_code());
                    return;
                },
                Err(err) => {
                    warn!(shard = self.shard_id, error = %err, "gateway connection error");
                    if !self
                        .reconnect_pause(&mut attempt, ReconnectDelay::Backoff)
                        .await
                    {
                        return;
                    }
                },
            }
        }
    }

    /// Sleep out the reconnect delay. Returns `false` when the runner
    /// must exit instead (disconnect requested, handle dropped, or the
    /// attempt budget is spent).
    async fn reconnect_pause(&mut self, attempt: &mut u32, delay: ReconnectDelay) -> bool {
        *attempt = attempt.saturating_add(1);
        if *attempt > self.config.reconnect.max_attempts {
            error!(
                shard = self.shard_id,
                attempts = *attempt,
                "reconnect attempts exhausted"
            );
            self.finish(ConnectionState::Stopped, None);
            return false;
        }

        let wait = match delay {
            ReconnectDelay::Backoff => self.reconnect_delay(*attempt),
            ReconnectDelay::SessionJitter => Duration::from_millis(fastrand::u64(1000..=5000)),
        };
        info!(
            shard = self.shard_id,
            wait_ms = wait.as_millis(),
            attempt = *attempt,
            "reconnecting after delay"
        );
        self.set_state(ConnectionState::Disconnected);

        if self.sleep_or_disconnect(wait).await {
            true
        } else {
            self.finish(ConnectionState::Disconnected, None);
            false
        }
    }

    /// The delay before reconnect attempt `attempt` (1-based): a
    /// uniformly random point in `0..=ceiling`, where the ceiling
    /// starts at the configured base and doubles per failed attempt up
    /// to the configured cap. Successful handshakes reset `attempt`,
    /// and with it the ceiling.
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        let reconnect = &self.config.reconnect;
        let doublings = attempt.saturating_sub(1).min(63);
        let ceiling = u128::from(reconnect.base_ms) << doublings;
        #[allow(clippy::cast_possible_truncation)]
        let capped = ceiling.min(u128::from(reconnect.max_ms)) as u64;
        if capped == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=capped))
    }

    /// One full connection attempt: discover, connect, handshake, pump.
    async fn connect_once(&mut self, attempt: &mut u32) -> GatewayResult<LoopAction> {
        self.set_state(ConnectionState::Connecting);

        let resuming = self.session.can_resume();
        if !resuming {
            // Identify gate: within a bucket, identifies are serialized
            // and spaced; resumes are exempt.
            self.gate.acquire(self.shard_id).await;
        }

        let base_url = self.resolve_gateway_url().await?;
        let ws_url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            colloquy_core::gateway_query()
        );
        info!(shard = self.shard_id, url = %ws_url, resuming, "connecting to gateway");

        let conn = GatewayConnection::connect(&ws_url).await?;
        self.shared.bump_connection_id();
        let (writer, mut reader) = conn.into_parts();

        self.set_state(ConnectionState::AwaitingHello);
        let hello = Self::wait_for_hello(&mut reader, self.config.hello_timeout).await?;
        let interval_ms = hello.heartbeat_interval.max(1);

        self.set_state(if resuming {
            ConnectionState::Resuming
        } else {
            ConnectionState::Identifying
        });

        let sequence = Arc::new(Mutex::new(self.session.sequence));
        let hb_state = Arc::new(Mutex::new(HeartbeatState::new()));
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_DEPTH);
        let (zombie_tx, zombie_rx) = oneshot::channel();
        let (hb_shutdown_tx, hb_shutdown_rx) = broadcast::channel(1);

        let mut writer_handle = spawn_writer(writer, outbound_rx);

        // Identify/resume is enqueued before the heartbeat task starts,
        // so no heartbeat can be reordered ahead of it on the wire.
        let auth = self.build_auth_payload();
        outbound_tx
            .send(Outbound::Payload(auth))
            .await
            .map_err(|_| GatewayError::Protocol("writer queue closed before handshake".into()))?;

        let heartbeat_handle = tokio::spawn(heartbeat::run_heartbeat(
            interval_ms,
            Arc::clone(&sequence),
            Arc::clone(&hb_state),
            outbound_tx.clone(),
            zombie_tx,
            hb_shutdown_rx,
        ));

        let action = self
            .event_loop(
                &mut reader,
                &outbound_tx,
                &sequence,
                &hb_state,
                zombie_rx,
                attempt,
                interval_ms,
            )
            .await;

        // Teardown: stop the heartbeat timer, give the writer a short
        // grace to flush (the close frame in particular), then abort.
        drop(hb_shutdown_tx);
        heartbeat_handle.abort();
        drop(outbound_tx);
        tokio::select! {
            _ = &mut writer_handle => {},
            () = tokio::time::sleep(WRITER_DRAIN_GRACE) => {
                writer_handle.abort();
            },
        }

        action
    }

    /// The gateway URL to connect to: the validated resume URL when
    /// resuming, otherwise the discovery endpoint (cached by the HTTP
    /// layer when caching is enabled).
    async fn resolve_gateway_url(&mut self) -> GatewayResult<String> {
        if self.session.can_resume() {
            let url = self.session.resume_gateway_url.clone().unwrap_or_default();
            if protocol::is_valid_resume_url(&url) {
                return Ok(url);
            }
            warn!(shard = self.shard_id, url = %url, "invalid resume URL, discovering fresh");
            self.session.clear();
        }

        let response = self.http.send(&endpoint::GATEWAY, &[], &[], None).await?;
        if !response.is_success() {
            return Err(GatewayError::Protocol(format!(
                "gateway discovery failed with status {}",
                response.status
            )));
        }
        response
            .body
            .get("url")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| GatewayError::Protocol("gateway discovery response missing url".into()))
    }

    /// Identify or resume, depending on held session state.
    fn build_auth_payload(&self) -> GatewayPayload {
        match (self.session.can_resume(), self.session.session_id.as_deref()) {
            (true, Some(session_id)) => protocol::build_resume(
                &self.config.token,
                session_id,
                self.session.sequence.unwrap_or(0),
            ),
            _ => protocol::build_identify(&IdentifyFields {
                token: &self.config.token,
                intents: self.config.intents,
                properties: &self.config.properties,
                shard_id: self.shard_id,
                shard_count: self.shard_count,
                presence: self.config.presence.as_ref(),
                compress: self.config.compress,
                large_threshold: self.config.large_threshold,
            }),
        }
    }

    /// Wait for the Hello frame after the transport opens.
    async fn wait_for_hello(reader: &mut WsReader, timeout: Duration) -> GatewayResult<HelloData> {
        let hello_fut = async {
            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let payload: GatewayPayload = serde_json::from_str(&text)?;
                        if payload.op == opcode::HELLO {
                            let data = payload.d.ok_or_else(|| {
                                GatewayError::Protocol("Hello missing data".into())
                            })?;
                            return Ok(serde_json::from_value::<HelloData>(data)?);
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map_or(1000, |f| f.code.into());
                        return Err(close_error(code));
                    },
                    Some(Ok(_)) => {},
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        return Err(GatewayError::Protocol(
                            "connection closed before Hello".into(),
                        ));
                    },
                }
            }
        };

        tokio::time::timeout(timeout, hello_fut)
            .await
            .map_err(|_| GatewayError::HelloTimeout)?
    }

    /// The event pump. Returns how the reconnection loop proceeds.
    #[allow(clippy::too_many_arguments)]
    async fn event_loop(
        &mut self,
        reader: &mut WsReader,
        outbound_tx: &mpsc::Sender<Outbound>,
        sequence: &Arc<Mutex<Option<u64>>>,
        hb_state: &Arc<Mutex<HeartbeatState>>,
        mut zombie_rx: oneshot::Receiver<()>,
        attempt: &mut u32,
        interval_ms: u64,
    ) -> GatewayResult<LoopAction> {
        // Read watchdog: a link that stays silent for 1.5 heartbeat
        // intervals is as dead as one that skips ACKs.
        let watchdog = Duration::from_millis(interval_ms.saturating_mul(3) / 2);
        let mut read_deadline = Instant::now() + watchdog;
        let mut ready_deadline = Some(Instant::now() + self.config.ready_timeout);

        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => {
                    match command {
                        Some(ShardCommand::Disconnect(ack)) => {
                            info!(shard = self.shard_id, "disconnect requested");
                            self.set_state(ConnectionState::Closing);
                            self.pending_disconnects.push(ack);
                            let _ = outbound_tx.send(Outbound::Close(1000)).await;
                            return Ok(LoopAction::Shutdown);
                        },
                        Some(command) => self.handle_command(command, outbound_tx).await,
                        None => {
                            // Every handle is gone; nobody can observe
                            // this shard any more.
                            debug!(shard = self.shard_id, "all handles dropped, closing");
                            self.set_state(ConnectionState::Closing);
                            let _ = outbound_tx.send(Outbound::Close(1000)).await;
                            return Ok(LoopAction::Shutdown);
                        },
                    }
                }

                _ = &mut zombie_rx => {
                    warn!(shard = self.shard_id, "zombie link, closing with 4000");
                    let _ = outbound_tx.send(Outbound::Close(ZOMBIE_CLOSE_CODE)).await;
                    return Ok(LoopAction::reconnect());
                }

                () = tokio::time::sleep_until(read_deadline) => {
                    warn!(
                        shard = self.shard_id,
                        silent_ms = watchdog.as_millis(),
                        "read watchdog expired, treating link as zombie"
                    );
                    let _ = outbound_tx.send(Outbound::Close(ZOMBIE_CLOSE_CODE)).await;
                    return Ok(LoopAction::reconnect());
                }

                () = sleep_until_opt(ready_deadline) => {
                    warn!(shard = self.shard_id, "identify not acknowledged in time");
                    return Err(GatewayError::ReadyTimeout);
                }

                message = reader.next() => {
                    read_deadline = Instant::now() + watchdog;
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let payload: GatewayPayload = match serde_json::from_str(&text) {
                                Ok(payload) => payload,
                                Err(err) => {
                                    // Malformed frames are surfaced but
                                    // never close the connection.
                                    warn!(
                                        shard = self.shard_id,
                                        error = %err,
                                        "failed to parse gateway frame"
                                    );
                                    self.multiplexer.publish_failure(ParseFailure {
                                        shard_id: self.shard_id,
                                        error: err.to_string(),
                                        raw: text.to_string(),
                                    });
                                    continue;
                                },
                            };
                            if let Some(action) = self
                                .handle_payload(
                                    payload,
                                    outbound_tx,
                                    sequence,
                                    hb_state,
                                    attempt,
                                    &mut ready_deadline,
                                )
                                .await?
                            {
                                return Ok(action);
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map_or(1000, |f| f.code.into());
                            return self.handle_close_code(code);
                        },
                        Some(Ok(_)) => {},
                        Some(Err(err)) => {
                            warn!(shard = self.shard_id, error = %err, "WebSocket read error");
                            return Ok(LoopAction::reconnect());
                        },
                        None => {
                            warn!(shard = self.shard_id, "WebSocket stream ended");
                            return Ok(LoopAction::reconnect());
                        },
                    }
                }
            }
        }
    }

    /// Handle a single inbound payload.
    ///
    /// Returns `Some(action)` when the event loop must end.
    async fn handle_payload(
        &mut self,
        payload: GatewayPayload,
        outbound_tx: &mpsc::Sender<Outbound>,
        sequence: &Arc<Mutex<Option<u64>>>,
        hb_state: &Arc<Mutex<HeartbeatState>>,
        attempt: &mut u32,
        ready_deadline: &mut Option<Instant>,
    ) -> GatewayResult<Option<LoopAction>> {
        match payload.op {
            opcode::DISPATCH => {
                self.handle_dispatch(payload, sequence, attempt, ready_deadline)
                    .await
            },
            opcode::HEARTBEAT => {
                // Server-initiated heartbeat: answer immediately.
                let seq = *sequence.lock().await;
                let _ = outbound_tx
                    .send(Outbound::Payload(protocol::build_heartbeat(seq)))
                    .await;
                Ok(None)
            },
            opcode::HEARTBEAT_ACK => {
                hb_state.lock().await.ack_received();
                Ok(None)
            },
            opcode::RECONNECT => {
                info!(shard = self.shard_id, "server requested reconnect (op=7)");
                let _ = outbound_tx.send(Outbound::Close(ZOMBIE_CLOSE_CODE)).await;
                Ok(Some(LoopAction::reconnect()))
            },
            opcode::INVALID_SESSION => Ok(Some(self.handle_invalid_session(&payload))),
            opcode::HELLO => {
                warn!(shard = self.shard_id, "unexpected Hello (op=10) mid-session");
                Ok(None)
            },
            other => {
                debug!(shard = self.shard_id, op = other, "unknown gateway opcode");
                Ok(None)
            },
        }
    }

    /// Handle a dispatch event (op=0).
    async fn handle_dispatch(
        &mut self,
        payload: GatewayPayload,
        sequence: &Arc<Mutex<Option<u64>>>,
        attempt: &mut u32,
        ready_deadline: &mut Option<Instant>,
    ) -> GatewayResult<Option<LoopAction>> {
        if let Some(seq) = payload.s {
            // Sequence numbers are monotonic within a session; a replay
            // below the watermark is ignored.
            let mut guard = sequence.lock().await;
            if guard.map_or(true, |current| seq > current) {
                *guard = Some(seq);
                self.session.sequence = Some(seq);
            } else {
                trace!(shard = self.shard_id, seq, "non-monotonic sequence ignored");
            }
        }

        let name = payload.t.as_deref().unwrap_or("");
        match name {
            "READY" => {
                let data = payload
                    .d
                    .ok_or_else(|| GatewayError::Protocol("READY event missing data".into()))?;
                let ready: ReadyData = serde_json::from_value(data)?;

                info!(
                    shard = self.shard_id,
                    session_id = %ready.session_id,
                    bot_user_id = %ready.user.id,
                    "gateway session established (READY)"
                );

                self.session.session_id = Some(ready.session_id.clone());
                if protocol::is_valid_resume_url(&ready.resume_gateway_url) {
                    self.session.resume_gateway_url = Some(ready.resume_gateway_url.clone());
                } else {
                    warn!(
                        shard = self.shard_id,
                        url = %ready.resume_gateway_url,
                        "READY contained invalid resume URL, ignoring"
                    );
                    self.session.resume_gateway_url = None;
                }

                self.set_state(ConnectionState::Connected);
                *attempt = 0;
                *ready_deadline = None;
                self.multiplexer.publish(GatewayEvent::Ready {
                    shard_id: self.shard_id,
                    data: ready,
                });
                Ok(None)
            },
            "RESUMED" => {
                info!(shard = self.shard_id, "gateway session resumed");
                self.set_state(ConnectionState::Connected);
                *attempt = 0;
                *ready_deadline = None;
                self.multiplexer.publish(GatewayEvent::Resumed {
                    shard_id: self.shard_id,
                });
                Ok(None)
            },
            _ => {
                trace!(shard = self.shard_id, event = name, "dispatch");
                self.multiplexer.publish(GatewayEvent::Dispatch {
                    shard_id: self.shard_id,
                    name: name.to_string(),
                    sequence: payload.s,
                    data: payload.d.unwrap_or(serde_json::Value::Null),
                });
                Ok(None)
            },
        }
    }

    /// Handle an invalid session (op=9): resume when the payload says
    /// the session survived, re-identify otherwise, after 1–5 s either
    /// way.
    fn handle_invalid_session(&mut self, payload: &GatewayPayload) -> LoopAction {
        let resumable = payload
            .d
            .as_ref()
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if resumable {
            info!(shard = self.shard_id, "invalid session (resumable), will resume");
            LoopAction::Reconnect {
                clear_session: false,
                delay: ReconnectDelay::SessionJitter,
            }
        } else {
            info!(
                shard = self.shard_id,
                "invalid session (not resumable), will re-identify"
            );
            LoopAction::Reconnect {
                clear_session: true,
                delay: ReconnectDelay::SessionJitter,
            }
        }
    }

    /// Classify a close frame into the next loop action.
    fn handle_close_code(&mut self, code: u16) -> GatewayResult<LoopAction> {
        match protocol::close_action(code) {
            CloseAction::Terminal => Err(close_error(code)),
            CloseAction::Reidentify => {
                info!(
                    shard = self.shard_id,
                    code,
                    name = protocol::close_code_name(code),
                    "close requires fresh identify"
                );
                Ok(LoopAction::reidentify())
            },
            CloseAction::ReconnectDelayed => {
                warn!(
                    shard = self.shard_id,
                    code, "gateway rate limited us, reconnecting after delay"
                );
                Ok(LoopAction::reconnect())
            },
            CloseAction::Resume => {
                info!(
                    shard = self.shard_id,
                    code,
                    name = protocol::close_code_name(code),
                    "close received, reconnecting"
                );
                Ok(LoopAction::reconnect())
            },
        }
    }

    /// Forward an outbound command, or drop it silently when the shard
    /// is not connected.
    async fn handle_command(&mut self, command: ShardCommand, outbound_tx: &mpsc::Sender<Outbound>) {
        if self.shared.state() != ConnectionState::Connected {
            debug!(shard = self.shard_id, "outbound command dropped, not connected");
            return;
        }
        let payload = match command {
            ShardCommand::UpdatePresence(presence) => {
                protocol::build_command(opcode::PRESENCE_UPDATE, &presence)
            },
            ShardCommand::RequestGuildMembers(request) => {
                protocol::build_command(opcode::REQUEST_GUILD_MEMBERS, &request)
            },
            ShardCommand::UpdateVoiceState(update) => {
                protocol::build_command(opcode::VOICE_STATE_UPDATE, &update)
            },
            ShardCommand::Disconnect(_) => None,
        };
        if let Some(payload) = payload {
            let _ = outbound_tx.send(Outbound::Payload(payload)).await;
        }
    }

    /// Sleep between reconnect attempts, staying responsive to
    /// disconnect requests. Returns `false` when the runner must exit.
    async fn sleep_or_disconnect(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => {
                    match command {
                        Some(ShardCommand::Disconnect(ack)) => {
                            self.pending_disconnects.push(ack);
                            return false;
                        },
                        Some(_) => {
                            debug!(shard = self.shard_id, "command dropped while disconnected");
                        },
                        None => return false,
                    }
                }
                () = &mut sleep => return true,
            }
        }
    }

    /// Final state transition: bump the connection id so observers see
    /// the shutdown, emit `ShardStopped` for terminal stops, release
    /// pending disconnect acks.
    fn finish(&mut self, state: ConnectionState, close_code: Option<u16>) {
        self.set_state(state);
        self.shared.bump_connection_id();
        if state == ConnectionState::Stopped {
            self.multiplexer.publish(GatewayEvent::ShardStopped {
                shard_id: self.shard_id,
                close_code,
            });
        }
        for ack in self.pending_disconnects.drain(..) {
            let _ = ack.send(());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }
}

/// Sleep until an optional deadline; pend forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::BotToken;
    use colloquy_http::HttpClientConfig;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::new(BotToken::new(format!(
            "shard-test-token-{}",
            fastrand::u64(..)
        )));
        config.http = HttpClientConfig::default();
        config
    }

    fn test_runner(config: GatewayConfig) -> (ShardRunner, EventMultiplexer) {
        let multiplexer = EventMultiplexer::new();
        let http = Arc::new(HttpClient::new(config.token.clone(), config.http.clone()).unwrap());
        let (_command_tx, command_rx) = mpsc::channel(4);
        let runner = ShardRunner {
            config: Arc::new(config),
            shard_id: 0,
            shard_count: 1,
            shared: Arc::new(ShardShared::new()),
            session: SessionState::default(),
            multiplexer: multiplexer.clone(),
            gate: Arc::new(IdentifyGate::new(1)),
            http,
            command_rx,
            pending_disconnects: Vec::new(),
        };
        (runner, multiplexer)
    }

    // ── Session state ───────────────────────────────────────

    #[test]
    fn session_can_resume_requires_both_fields() {
        let mut session = SessionState::default();
        assert!(!session.can_resume());
        session.session_id = Some("sess".into());
        assert!(!session.can_resume());
        session.resume_gateway_url = Some("wss://gateway.discord.gg".into());
        assert!(session.can_resume());
    }

    #[test]
    fn session_clear_keeps_sequence() {
        let mut session = SessionState {
            session_id: Some("sess".into()),
            resume_gateway_url: Some("wss://gateway.discord.gg".into()),
            sequence: Some(42),
        };
        session.clear();
        assert!(!session.can_resume());
        assert_eq!(session.sequence, Some(42));
    }

    // ── Shared state ────────────────────────────────────────

    #[test]
    fn connection_id_bumps_monotonically() {
        let shared = ShardShared::new();
        assert_eq!(shared.connection_id(), 0);
        assert_eq!(shared.bump_connection_id(), 1);
        assert_eq!(shared.bump_connection_id(), 2);
        assert_eq!(shared.connection_id(), 2);
    }

    #[test]
    fn state_roundtrips_through_atomic() {
        let shared = ShardShared::new();
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::AwaitingHello,
            ConnectionState::Identifying,
            ConnectionState::Resuming,
            ConnectionState::Connected,
            ConnectionState::Closing,
            ConnectionState::Stopped,
        ] {
            shared.set_state(state);
            assert_eq!(shared.state(), state);
        }
    }

    // ── Reconnect delay ─────────────────────────────────────

    #[tokio::test]
    async fn reconnect_delay_first_attempt_bounded_by_base() {
        let mut config = test_config();
        config.reconnect.base_ms = 1000;
        config.reconnect.max_ms = 128_000;
        let (runner, _mux) = test_runner(config);

        for _ in 0..100 {
            assert!(runner.reconnect_delay(1) <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn reconnect_delay_ceiling_doubles_then_caps() {
        let mut config = test_config();
        config.reconnect.base_ms = 500;
        config.reconnect.max_ms = 4000;
        let (runner, _mux) = test_runner(config);

        for _ in 0..100 {
            assert!(runner.reconnect_delay(2) <= Duration::from_millis(1000));
            assert!(runner.reconnect_delay(3) <= Duration::from_millis(2000));
        }
        // Far past the doubling range the cap holds, including at
        // attempt counts that would overflow a shifted ceiling.
        for attempt in [4, 10, 64, u32::MAX] {
            for _ in 0..50 {
                assert!(
                    runner.reconnect_delay(attempt) <= Duration::from_millis(4000),
                    "attempt {attempt}"
                );
            }
        }
    }

    #[tokio::test]
    async fn reconnect_delay_zero_base_is_immediate() {
        let mut config = test_config();
        config.reconnect.base_ms = 0;
        config.reconnect.max_ms = 0;
        let (runner, _mux) = test_runner(config);

        for attempt in 0..10 {
            assert_eq!(runner.reconnect_delay(attempt), Duration::ZERO);
        }
    }

    // ── Auth payload ────────────────────────────────────────

    #[tokio::test]
    async fn auth_payload_identifies_without_session() {
        let (runner, _mux) = test_runner(test_config());
        let payload = runner.build_auth_payload();
        assert_eq!(payload.op, opcode::IDENTIFY);
        let d = payload.d.unwrap();
        assert_eq!(d["shard"], serde_json::json!([0, 1]));
    }

    #[tokio::test]
    async fn auth_payload_resumes_with_session() {
        let (mut runner, _mux) = test_runner(test_config());
        runner.session.session_id = Some("s1".into());
        runner.session.resume_gateway_url = Some("wss://gateway.discord.gg".into());
        runner.session.sequence = Some(55);

        let payload = runner.build_auth_payload();
        assert_eq!(payload.op, opcode::RESUME);
        let d = payload.d.unwrap();
        assert_eq!(d["session_id"], "s1");
        assert_eq!(d["seq"], 55);
    }

    // ── Invalid session ─────────────────────────────────────

    #[tokio::test]
    async fn invalid_session_resumable_keeps_session() {
        let (mut runner, _mux) = test_runner(test_config());
        let payload = GatewayPayload {
            op: opcode::INVALID_SESSION,
            d: Some(serde_json::Value::Bool(true)),
            s: None,
            t: None,
        };
        let action = runner.handle_invalid_session(&payload);
        assert!(matches!(
            action,
            LoopAction::Reconnect {
                clear_session: false,
                delay: ReconnectDelay::SessionJitter,
            }
        ));
    }

    #[tokio::test]
    async fn invalid_session_not_resumable_clears() {
        let (mut runner, _mux) = test_runner(test_config());
        let payload = GatewayPayload {
            op: opcode::INVALID_SESSION,
            d: Some(serde_json::Value::Bool(false)),
            s: None,
            t: None,
        };
        let action = runner.handle_invalid_session(&payload);
        assert!(matches!(
            action,
            LoopAction::Reconnect {
                clear_session: true,
                delay: ReconnectDelay::SessionJitter,
            }
        ));
    }

    #[tokio::test]
    async fn invalid_session_missing_data_reidentifies() {
        let (mut runner, _mux) = test_runner(test_config());
        let payload = GatewayPayload {
            op: opcode::INVALID_SESSION,
            d: None,
            s: None,
            t: None,
        };
        let action = runner.handle_invalid_session(&payload);
        assert!(matches!(
            action,
            LoopAction::Reconnect {
                clear_session: true,
                ..
            }
        ));
    }

    // ── Close codes ─────────────────────────────────────────

    #[tokio::test]
    async fn close_4004_is_auth_failure() {
        let (mut runner, _mux) = test_runner(test_config());
        let result = runner.handle_close_code(4004);
        assert!(matches!(result, Err(GatewayError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn close_terminal_family() {
        let (mut runner, _mux) = test_runner(test_config());
        assert!(matches!(
            runner.handle_close_code(4010),
            Err(GatewayError::UnrecoverableClose(4010))
        ));
        assert!(matches!(
            runner.handle_close_code(4011),
            Err(GatewayError::UnrecoverableClose(4011))
        ));
        assert!(matches!(
            runner.handle_close_code(4012),
            Err(GatewayError::UnrecoverableClose(4012))
        ));
        assert!(matches!(
            runner.handle_close_code(4013),
            Err(GatewayError::InvalidIntents(4013))
        ));
        assert!(matches!(
            runner.handle_close_code(4014),
            Err(GatewayError::InvalidIntents(4014))
        ));
    }

    #[tokio::test]
    async fn close_transient_reconnects() {
        let (mut runner, _mux) = test_runner(test_config());
        for code in [1000, 1001, 4000, 4001, 4005, 4007] {
            let action = runner.handle_close_code(code).unwrap();
            assert!(
                matches!(
                    action,
                    LoopAction::Reconnect {
                        clear_session: false,
                        delay: ReconnectDelay::Backoff,
                    }
                ),
                "code {code}"
            );
        }
    }

    #[tokio::test]
    async fn close_session_invalidating_codes_reidentify() {
        let (mut runner, _mux) = test_runner(test_config());
        for code in [4006, 4009] {
            let action = runner.handle_close_code(code).unwrap();
            assert!(
                matches!(
                    action,
                    LoopAction::Reconnect {
                        clear_session: true,
                        ..
                    }
                ),
                "code {code}"
            );
        }
    }

    // ── Dispatch handling ───────────────────────────────────

    fn ready_payload(seq: u64) -> GatewayPayload {
        GatewayPayload {
            op: opcode::DISPATCH,
            d: Some(serde_json::json!({
                "v": 10,
                "session_id": "ready-sess",
                "resume_gateway_url": "wss://gateway.discord.gg",
                "user": { "id": "bot-42", "bot": true },
                "guilds": [],
                "application": { "id": "app-1" },
            })),
            s: Some(seq),
            t: Some("READY".into()),
        }
    }

    #[tokio::test]
    async fn ready_stores_session_and_publishes() {
        let (mut runner, mux) = test_runner(test_config());
        let mut events = mux.make_events_stream();
        let sequence = Arc::new(Mutex::new(None));
        let mut attempt = 3u32;
        let mut ready_deadline = Some(Instant::now() + Duration::from_secs(60));

        let result = runner
            .handle_dispatch(
                ready_payload(1),
                &sequence,
                &mut attempt,
                &mut ready_deadline,
            )
            .await
            .unwrap();

        assert!(result.is_none(), "READY must not end the event loop");
        assert_eq!(runner.session.session_id.as_deref(), Some("ready-sess"));
        assert!(runner.session.can_resume());
        assert_eq!(runner.shared.state(), ConnectionState::Connected);
        assert_eq!(attempt, 0, "successful handshake resets the attempt budget");
        assert!(ready_deadline.is_none());

        match events.try_recv().unwrap() {
            GatewayEvent::Ready { shard_id, data } => {
                assert_eq!(shard_id, 0);
                assert_eq!(data.v, 10);
                assert!(data.user.bot);
                assert_eq!(data.application.unwrap().id, "app-1");
            },
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ready_rejects_invalid_resume_url() {
        let (mut runner, _mux) = test_runner(test_config());
        let sequence = Arc::new(Mutex::new(None));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: opcode::DISPATCH,
            d: Some(serde_json::json!({
                "v": 10,
                "session_id": "sess-2",
                "resume_gateway_url": "wss://evil.example.com",
                "user": { "id": "bot-42" },
            })),
            s: Some(1),
            t: Some("READY".into()),
        };
        runner
            .handle_dispatch(payload, &sequence, &mut attempt, &mut ready_deadline)
            .await
            .unwrap();

        assert_eq!(runner.session.session_id.as_deref(), Some("sess-2"));
        assert!(
            !runner.session.can_resume(),
            "invalid resume URL must be rejected"
        );
    }

    #[tokio::test]
    async fn resumed_publishes_and_connects() {
        let (mut runner, mux) = test_runner(test_config());
        let mut events = mux.make_events_stream();
        let sequence = Arc::new(Mutex::new(Some(10u64)));
        let mut attempt = 2u32;
        let mut ready_deadline = Some(Instant::now() + Duration::from_secs(60));

        let payload = GatewayPayload {
            op: opcode::DISPATCH,
            d: None,
            s: Some(99),
            t: Some("RESUMED".into()),
        };
        runner
            .handle_dispatch(payload, &sequence, &mut attempt, &mut ready_deadline)
            .await
            .unwrap();

        assert_eq!(runner.shared.state(), ConnectionState::Connected);
        assert_eq!(*sequence.lock().await, Some(99));
        assert!(matches!(
            events.try_recv().unwrap(),
            GatewayEvent::Resumed { shard_id: 0 }
        ));
    }

    #[tokio::test]
    async fn dispatch_publishes_event_and_advances_sequence() {
        let (mut runner, mux) = test_runner(test_config());
        let mut events = mux.make_events_stream();
        let sequence = Arc::new(Mutex::new(Some(5u64)));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: opcode::DISPATCH,
            d: Some(serde_json::json!({"id": "m1", "content": "hi"})),
            s: Some(6),
            t: Some("MESSAGE_CREATE".into()),
        };
        runner
            .handle_dispatch(payload, &sequence, &mut attempt, &mut ready_deadline)
            .await
            .unwrap();

        assert_eq!(*sequence.lock().await, Some(6));
        assert_eq!(runner.session.sequence, Some(6));
        match events.try_recv().unwrap() {
            GatewayEvent::Dispatch {
                name,
                sequence,
                data,
                ..
            } => {
                assert_eq!(name, "MESSAGE_CREATE");
                assert_eq!(sequence, Some(6));
                assert_eq!(data["content"], "hi");
            },
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_sequence_is_monotonic() {
        let (mut runner, _mux) = test_runner(test_config());
        let sequence = Arc::new(Mutex::new(Some(10u64)));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        // A replayed lower sequence must not move the watermark back.
        let payload = GatewayPayload {
            op: opcode::DISPATCH,
            d: Some(serde_json::json!({})),
            s: Some(4),
            t: Some("MESSAGE_CREATE".into()),
        };
        runner
            .handle_dispatch(payload, &sequence, &mut attempt, &mut ready_deadline)
            .await
            .unwrap();

        assert_eq!(*sequence.lock().await, Some(10));
    }

    // ── Payload routing ─────────────────────────────────────

    #[tokio::test]
    async fn server_heartbeat_request_is_answered() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let sequence = Arc::new(Mutex::new(Some(42u64)));
        let hb_state = Arc::new(Mutex::new(HeartbeatState::new()));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: opcode::HEARTBEAT,
            d: None,
            s: None,
            t: None,
        };
        let result = runner
            .handle_payload(
                payload,
                &outbound_tx,
                &sequence,
                &hb_state,
                &mut attempt,
                &mut ready_deadline,
            )
            .await
            .unwrap();
        assert!(result.is_none());

        match outbound_rx.try_recv().unwrap() {
            Outbound::Payload(payload) => {
                assert_eq!(payload.op, opcode::HEARTBEAT);
                assert_eq!(payload.d, Some(serde_json::Value::from(42)));
            },
            Outbound::Close(_) => panic!("expected heartbeat"),
        }
    }

    #[tokio::test]
    async fn heartbeat_ack_updates_state() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let sequence = Arc::new(Mutex::new(None));
        let hb_state = Arc::new(Mutex::new(HeartbeatState::new()));
        hb_state.lock().await.beat_sent();
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: opcode::HEARTBEAT_ACK,
            d: None,
            s: None,
            t: None,
        };
        runner
            .handle_payload(
                payload,
                &outbound_tx,
                &sequence,
                &hb_state,
                &mut attempt,
                &mut ready_deadline,
            )
            .await
            .unwrap();

        assert!(!hb_state.lock().await.is_zombie());
    }

    #[tokio::test]
    async fn reconnect_request_closes_and_resumes() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        let sequence = Arc::new(Mutex::new(None));
        let hb_state = Arc::new(Mutex::new(HeartbeatState::new()));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: opcode::RECONNECT,
            d: None,
            s: None,
            t: None,
        };
        let result = runner
            .handle_payload(
                payload,
                &outbound_tx,
                &sequence,
                &hb_state,
                &mut attempt,
                &mut ready_deadline,
            )
            .await
            .unwrap();

        assert!(matches!(
            result,
            Some(LoopAction::Reconnect {
                clear_session: false,
                ..
            })
        ));
        assert!(matches!(
            outbound_rx.try_recv().unwrap(),
            Outbound::Close(4000)
        ));
    }

    #[tokio::test]
    async fn unknown_opcode_is_ignored() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let sequence = Arc::new(Mutex::new(None));
        let hb_state = Arc::new(Mutex::new(HeartbeatState::new()));
        let mut attempt = 0u32;
        let mut ready_deadline = None;

        let payload = GatewayPayload {
            op: 255,
            d: None,
            s: None,
            t: None,
        };
        let result = runner
            .handle_payload(
                payload,
                &outbound_tx,
                &sequence,
                &hb_state,
                &mut attempt,
                &mut ready_deadline,
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    // ── Outbound commands ───────────────────────────────────

    #[tokio::test]
    async fn commands_dropped_unless_connected() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);

        runner.shared.set_state(ConnectionState::Identifying);
        runner
            .handle_command(
                ShardCommand::UpdatePresence(PresenceUpdate::default()),
                &outbound_tx,
            )
            .await;
        assert!(outbound_rx.try_recv().is_err(), "command must be dropped");

        runner.shared.set_state(ConnectionState::Connected);
        runner
            .handle_command(
                ShardCommand::UpdatePresence(PresenceUpdate::default()),
                &outbound_tx,
            )
            .await;
        match outbound_rx.try_recv().unwrap() {
            Outbound::Payload(payload) => assert_eq!(payload.op, opcode::PRESENCE_UPDATE),
            Outbound::Close(_) => panic!("expected presence payload"),
        }
    }

    #[tokio::test]
    async fn commands_serialize_in_order() {
        let (mut runner, _mux) = test_runner(test_config());
        let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
        runner.shared.set_state(ConnectionState::Connected);

        runner
            .handle_command(
                ShardCommand::RequestGuildMembers(RequestGuildMembers {
                    guild_id: "1".into(),
                    query: String::new(),
                    limit: 0,
                    presences: false,
                    nonce: None,
                }),
                &outbound_tx,
            )
            .await;
        runner
            .handle_command(
                ShardCommand::UpdatePresence(PresenceUpdate::default()),
                &outbound_tx,
            )
            .await;
        runner
            .handle_command(
                ShardCommand::UpdateVoiceState(VoiceStateUpdate {
                    guild_id: "1".into(),
                    channel_id: Some("2".into()),
                    self_mute: false,
                    self_deaf: false,
                }),
                &outbound_tx,
            )
            .await;

        let ops: Vec<u8> = std::iter::from_fn(|| outbound_rx.try_recv().ok())
            .map(|outbound| match outbound {
                Outbound::Payload(payload) => payload.op,
                Outbound::Close(_) => 0,
            })
            .collect();
        assert_eq!(
            ops,
            vec![
                opcode::REQUEST_GUILD_MEMBERS,
                opcode::PRESENCE_UPDATE,
                opcode::VOICE_STATE_UPDATE,
            ]
        );
    }

    // ── Handle behavior ─────────────────────────────────────

    #[tokio::test]
    async fn fresh_shard_is_disconnected() {
        let shard = Shard::new(test_config(), 0, 1).unwrap();
        assert_eq!(shard.state(), ConnectionState::Disconnected);
        assert_eq!(shard.connection_id(), 0);
        assert_eq!(shard.shard_id(), 0);
        assert_eq!(shard.shard_count(), 1);
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop() {
        let shard = Shard::new(test_config(), 0, 1).unwrap();
        // Must return promptly without a runner to talk to.
        tokio::time::timeout(Duration::from_secs(1), shard.disconnect())
            .await
            .unwrap();
        assert_eq!(shard.connection_id(), 0);
    }

    #[tokio::test]
    async fn commands_before_connect_do_not_block() {
        let shard = Shard::new(test_config(), 0, 1).unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            shard.update_presence(PresenceUpdate::default()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn second_connect_errors() {
        let shard = Shard::new(test_config(), 0, 1).unwrap();
        // Swap the slot to Running to simulate a started shard without
        // touching the network.
        {
            let mut slot = shard.runner.lock().unwrap();
            *slot = RunnerSlot::Running(tokio::spawn(async {}));
        }
        let result = shard.connect().await;
        assert!(matches!(result, Err(GatewayError::Protocol(_))));
    }

    #[tokio::test]
    async fn finish_publishes_shard_stopped_and_bumps() {
        let (mut runner, mux) = test_runner(test_config());
        let mut events = mux.make_events_stream();
        let before = runner.shared.connection_id();

        runner.finish(ConnectionState::Stopped, Some(4010));

        assert_eq!(runner.shared.state(), ConnectionState::Stopped);
        assert_eq!(runner.shared.connection_id(), before + 1);
        match events.try_recv().unwrap() {
            GatewayEvent::ShardStopped {
                shard_id,
                close_code,
            } => {
                assert_eq!(shard_id, 0);
                assert_eq!(close_code, Some(4010));
            },
            other => panic!("expected ShardStopped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_releases_disconnect_acks() {
        let (mut runner, _mux) = test_runner(test_config());
        let (ack_tx, ack_rx) = oneshot::channel();
        runner.pending_disconnects.push(ack_tx);

        runner.finish(ConnectionState::Disconnected, None);

        assert!(ack_rx.await.is_ok());
    }

    #[tokio::test]
    async fn close_error_mapping() {
        assert!(matches!(
            close_error(4004),
            GatewayError::AuthenticationFailed
        ));
        assert!(matches!(close_error(4013), GatewayError::InvalidIntents(_)));
        assert!(matches!(
            close_error(4011),
            GatewayError::UnrecoverableClose(4011)
        ));
        assert!(matches!(close_error(1006), GatewayError::Closed(1006)));
    }
}
