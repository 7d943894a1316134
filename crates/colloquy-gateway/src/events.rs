//! Event multiplexer: broadcast fan-out of gateway events and parse
//! failures to any number of subscribers.
//!
//! One sender, many receivers. Queues are bounded (default 256 entries
//! per subscriber); a subscriber that falls further behind loses the
//! oldest entries and logs a warning with the drop count when it next
//! receives. Parse failures travel on a separate stream with the same
//! discipline.

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::protocol::ReadyData;

/// Default per-subscriber queue depth before oldest-entry drops begin.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event observed on the merged gateway stream.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The shard completed its handshake.
    Ready {
        /// Shard that became ready.
        shard_id: u32,
        /// Decoded Ready data.
        data: ReadyData,
    },
    /// The shard re-attached to its previous session.
    Resumed {
        /// Shard that resumed.
        shard_id: u32,
    },
    /// A dispatch event (op 0) other than Ready/Resumed.
    Dispatch {
        /// Shard the event arrived on.
        shard_id: u32,
        /// Event name, e.g. `MESSAGE_CREATE`.
        name: String,
        /// Sequence number assigned by the server.
        sequence: Option<u64>,
        /// Raw event payload; model decoding is the consumer's concern.
        data: serde_json::Value,
    },
    /// A shard stopped permanently (terminal close or exhausted
    /// reconnect budget). Other shards keep running.
    ShardStopped {
        /// Shard that stopped.
        shard_id: u32,
        /// Close code that stopped it, when one was received.
        close_code: Option<u16>,
    },
}

impl GatewayEvent {
    /// The shard this event belongs to.
    #[must_use]
    pub fn shard_id(&self) -> u32 {
        match self {
            Self::Ready { shard_id, .. }
            | Self::Resumed { shard_id }
            | Self::Dispatch { shard_id, .. }
            | Self::ShardStopped { shard_id, .. } => *shard_id,
        }
    }
}

/// A malformed inbound frame. Surfaced out-of-band; the connection
/// stays up.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    /// Shard the frame arrived on.
    pub shard_id: u32,
    /// Decode error description.
    pub error: String,
    /// The offending frame text.
    pub raw: String,
}

/// Broadcast fan-out for gateway events and parse failures.
///
/// Cloning shares the underlying channels; every clone publishes to the
/// same subscribers.
#[derive(Debug, Clone)]
pub struct EventMultiplexer {
    events: broadcast::Sender<GatewayEvent>,
    failures: broadcast::Sender<ParseFailure>,
    capacity: usize,
}

impl EventMultiplexer {
    /// Create a multiplexer with the default queue depth.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a multiplexer with a custom per-subscriber queue depth.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (failures, _) = broadcast::channel(capacity);
        Self {
            events,
            failures,
            capacity,
        }
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        match self.events.send(event) {
            Ok(count) => count,
            Err(_) => {
                trace!("no subscribers for gateway event");
                0
            },
        }
    }

    /// Publish a parse failure. Returns the number of subscribers
    /// reached.
    pub fn publish_failure(&self, failure: ParseFailure) -> usize {
        self.failures.send(failure).unwrap_or(0)
    }

    /// A new subscriber on the event stream.
    #[must_use]
    pub fn make_events_stream(&self) -> EventStream {
        Subscriber::new(self.events.subscribe(), "events")
    }

    /// A new subscriber on the parse-failure stream.
    #[must_use]
    pub fn make_parse_failures_stream(&self) -> ParseFailureStream {
        Subscriber::new(self.failures.subscribe(), "parse-failures")
    }

    /// Number of live event subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// The per-subscriber queue depth.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber on one of the multiplexed streams.
#[derive(Debug)]
pub struct Subscriber<T> {
    receiver: broadcast::Receiver<T>,
    stream_name: &'static str,
}

/// Subscriber on the gateway event stream.
pub type EventStream = Subscriber<GatewayEvent>;

/// Subscriber on the parse-failure stream.
pub type ParseFailureStream = Subscriber<ParseFailure>;

impl<T: Clone> Subscriber<T> {
    fn new(receiver: broadcast::Receiver<T>, stream_name: &'static str) -> Self {
        Self {
            receiver,
            stream_name,
        }
    }

    /// Receive the next entry.
    ///
    /// Returns `None` when every sender is gone. Falling behind the
    /// queue depth drops the oldest entries; the drop is logged and
    /// reception continues with the oldest surviving entry.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(
                        stream = self.stream_name,
                        dropped = count,
                        "slow subscriber, oldest entries dropped"
                    );
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive without blocking; `None` when empty or closed.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(entry) => return Some(entry),
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(
                        stream = self.stream_name,
                        dropped = count,
                        "slow subscriber, oldest entries dropped"
                    );
                },
                Err(
                    broadcast::error::TryRecvError::Empty
                    | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}
