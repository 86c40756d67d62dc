//! Channel trait: the persistent bidirectional event connection to the server.
//!
//! Implementations:
//! - `MemoryChannel` - in-process channel for tests
//! - `WsChannel` (in docsync-daemon) - WebSocket with reconnect
//!
//! A channel is one logical handle per mounted document view. Reconnecting
//! replaces the underlying connection but keeps the handle, and each live
//! connection gets a new `epoch`. Everything the server sends, plus
//! connect/disconnect transitions, arrives as `ChannelNotice`s on the
//! channel's event bus, in order.

use crate::events::EventBus;
use crate::protocol::{ClientEvent, ServerEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,

    #[error("Channel was closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Reason a connection ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// disconnect() called locally
    UserRequested,
    /// Transport error
    NetworkError,
    /// Server closed the connection
    RemoteClosed,
}

/// Something that happened on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// A new underlying connection is live.
    Connected { epoch: u64 },
    /// The connection with this epoch ended.
    Disconnected {
        epoch: u64,
        reason: DisconnectReason,
    },
    /// An event arrived from the server.
    Event(ServerEvent),
}

/// Bidirectional event channel to the server.
///
/// `emit` only queues the event, it never waits on the network.
pub trait Channel: Send + Sync {
    /// Queue an event for the server.
    fn emit(&self, event: ClientEvent) -> Result<()>;

    /// Bus carrying connection notices and inbound server events.
    fn notices(&self) -> &Arc<EventBus<ChannelNotice>>;

    /// Epoch of the live connection, `None` while disconnected.
    fn connection_epoch(&self) -> Option<u64>;

    /// Close the channel for good. Calling it again is a no-op.
    fn disconnect(&self);
}

/// What happened on a `MemoryChannel`, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRecord {
    Emitted(ClientEvent),
    Disconnected,
}

#[derive(Default)]
struct MemoryState {
    epoch: Option<u64>,
    next_epoch: u64,
    closed: bool,
    history: Vec<ChannelRecord>,
}

/// In-process channel for tests.
///
/// Records every outbound event and lets the test play the server: connect
/// and drop connections, and deliver server events.
pub struct MemoryChannel {
    state: Mutex<MemoryState>,
    notices: Arc<EventBus<ChannelNotice>>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            notices: Arc::new(EventBus::new()),
        }
    }
}

impl MemoryChannel {
    /// A channel that has not connected yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose first connection is already live.
    pub fn connected() -> Self {
        let channel = Self::new();
        channel.connect();
        channel
    }

    /// Bring up a new connection and announce it. Returns the new epoch.
    pub fn connect(&self) -> u64 {
        let epoch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.next_epoch += 1;
            state.epoch = Some(state.next_epoch);
            state.next_epoch
        };
        self.notices.emit(ChannelNotice::Connected { epoch });
        epoch
    }

    /// Simulate the transport losing the connection.
    pub fn drop_connection(&self) {
        let epoch = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .epoch
            .take();
        if let Some(epoch) = epoch {
            self.notices.emit(ChannelNotice::Disconnected {
                epoch,
                reason: DisconnectReason::NetworkError,
            });
        }
    }

    /// Deliver an event as if the server had sent it.
    pub fn deliver(&self, event: ServerEvent) {
        self.notices.emit(ChannelNotice::Event(event));
    }

    /// All events emitted so far.
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.history()
            .into_iter()
            .filter_map(|record| match record {
                ChannelRecord::Emitted(event) => Some(event),
                ChannelRecord::Disconnected => None,
            })
            .collect()
    }

    /// Emitted events and disconnects, interleaved in the order they happened.
    pub fn history(&self) -> Vec<ChannelRecord> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .clone()
    }

    /// Forget recorded history.
    pub fn clear(&self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

impl Channel for MemoryChannel {
    fn emit(&self, event: ClientEvent) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(ChannelError::Closed);
        }
        if state.epoch.is_none() {
            return Err(ChannelError::NotConnected);
        }
        state.history.push(ChannelRecord::Emitted(event));
        Ok(())
    }

    fn notices(&self) -> &Arc<EventBus<ChannelNotice>> {
        &self.notices
    }

    fn connection_epoch(&self) -> Option<u64> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).epoch
    }

    fn disconnect(&self) {
        let epoch = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.closed = true;
            state.history.push(ChannelRecord::Disconnected);
            state.epoch.take()
        };
        if let Some(epoch) = epoch {
            self.notices.emit(ChannelNotice::Disconnected {
                epoch,
                reason: DisconnectReason::UserRequested,
            });
        }
    }
}
