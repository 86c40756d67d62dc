//! Outgoing channel to the relay server.
//!
//! `WsChannel` is the native `Channel`: one logical handle that keeps a
//! WebSocket connection to the server alive, including:
//! - Connection establishment (with the session cookie, if any)
//! - Automatic reconnection with exponential backoff
//! - A new connection epoch, announced as `ChannelNotice::Connected`, for
//!   every successful connect
//!
//! Outbound events are queued and written by the connection task, so
//! `emit` never waits on the network. `disconnect` lets the queue drain
//! (a final `leave-document` still goes out) before the close frame.

use docsync_core::{
    Channel, ChannelError, ChannelNotice, ClientEvent, DisconnectReason, EventBus, ServerEvent,
};
use docsync_core::protocol::MAX_FRAME_SIZE;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest, http::HeaderValue, Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server endpoint, e.g. `ws://localhost:3001`
    pub url: String,
    /// Sent as the `Cookie` header on every connect
    pub cookie: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookie: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Default)]
struct LinkState {
    epoch: Option<u64>,
    sender: Option<mpsc::UnboundedSender<String>>,
    closed: bool,
}

struct Shared {
    state: Mutex<LinkState>,
    notices: Arc<EventBus<ChannelNotice>>,
    shutdown: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket channel with automatic reconnect.
pub struct WsChannel {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    /// Start connecting in the background. Must be called inside a Tokio
    /// runtime.
    pub fn connect(config: ChannelConfig) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(LinkState::default()),
            notices: Arc::new(EventBus::new()),
            shutdown: Notify::new(),
        });

        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            supervise(config, task_shared).await;
        });

        Arc::new(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Wait until the background task has finished after `disconnect`.
    pub async fn closed(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Channel for WsChannel {
    fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let state = self.shared.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        let sender = state.sender.as_ref().ok_or(ChannelError::NotConnected)?;
        let frame = event
            .to_frame()
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        sender
            .send(frame)
            .map_err(|_| ChannelError::NotConnected)
    }

    fn notices(&self) -> &Arc<EventBus<ChannelNotice>> {
        &self.shared.notices
    }

    fn connection_epoch(&self) -> Option<u64> {
        self.shared.lock().epoch
    }

    fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the sender ends the connection once the queue drains.
            state.sender = None;
        }
        self.shared.shutdown.notify_one();
        debug!("Channel disconnect requested");
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Connect, run the connection, and reconnect until closed.
async fn supervise(config: ChannelConfig, shared: Arc<Shared>) {
    let mut epoch = 0u64;
    let mut attempt = 0u32;

    loop {
        if shared.lock().closed {
            break;
        }

        match open(&config).await {
            Ok(ws) => {
                attempt = 0;
                epoch += 1;
                let (tx, rx) = mpsc::unbounded_channel();
                {
                    let mut state = shared.lock();
                    if state.closed {
                        break;
                    }
                    state.epoch = Some(epoch);
                    state.sender = Some(tx);
                }
                info!("Connected to {} (epoch {})", config.url, epoch);
                shared.notices.emit(ChannelNotice::Connected { epoch });

                let reason = run_connection(ws, rx, &shared.notices).await;

                {
                    let mut state = shared.lock();
                    state.epoch = None;
                    state.sender = None;
                }
                shared
                    .notices
                    .emit(ChannelNotice::Disconnected { epoch, reason });
                if reason == DisconnectReason::UserRequested {
                    break;
                }
                warn!("Connection to {} lost ({:?})", config.url, reason);
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", config.url, e);
            }
        }

        attempt += 1;
        if config
            .reconnect
            .max_attempts
            .map(|max| attempt >= max)
            .unwrap_or(false)
        {
            error!("Giving up on {} after {} attempts", config.url, attempt);
            shared.lock().closed = true;
            break;
        }

        let delay = calculate_backoff(attempt, &config.reconnect);
        info!("Reconnecting to {} in {:?} (attempt {})", config.url, delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.notified() => {}
        }
    }

    debug!("Channel task for {} finished", config.url);
}

async fn open(config: &ChannelConfig) -> Result<WsStream, WsError> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(cookie) = &config.cookie {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                request.headers_mut().insert("Cookie", value);
            }
            Err(e) => warn!("Ignoring invalid cookie: {}", e),
        }
    }
    let (ws, _) = connect_async(request).await?;
    Ok(ws)
}

/// Pump one live connection until it ends. Inbound frames are published in
/// arrival order on `notices`.
async fn run_connection(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    notices: &Arc<EventBus<ChannelNotice>>,
) -> DisconnectReason {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        error!("Failed to send frame: {}", e);
                        return DisconnectReason::NetworkError;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return DisconnectReason::UserRequested;
                }
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => deliver(text.as_bytes(), notices),
                Some(Ok(Message::Binary(data))) => deliver(&data, notices),
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Server closed the connection");
                    return DisconnectReason::RemoteClosed;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return DisconnectReason::RemoteClosed;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return DisconnectReason::NetworkError;
                }
            },
        }
    }
}

fn deliver(data: &[u8], notices: &Arc<EventBus<ChannelNotice>>) {
    if data.len() > MAX_FRAME_SIZE {
        warn!(
            "Frame exceeds max size ({} > {}), dropping",
            data.len(),
            MAX_FRAME_SIZE
        );
        return;
    }
    match ServerEvent::from_frame(data) {
        Ok(event) => {
            debug!("Received {}", event.name());
            notices.emit(ChannelNotice::Event(event));
        }
        Err(e) => warn!("Dropping frame: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Backoff calculation ====================

    #[test]
    fn test_calculate_backoff_first_attempt() {
        let config = ReconnectConfig::default();
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
    }

    #[test]
    fn test_calculate_backoff_exponential() {
        let config = ReconnectConfig::default();

        // 1s, 2s, 4s, 8s, 16s, 30s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(2));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(8));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(16));
        assert_eq!(calculate_backoff(6, &config), Duration::from_secs(30));
        assert_eq!(calculate_backoff(20, &config), Duration::from_secs(30));
    }

    #[test]
    fn test_calculate_backoff_custom_config() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 3.0,
            max_attempts: None,
        };

        // 1s, 3s, 9s, 10s (capped)
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(3));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(9));
        assert_eq!(calculate_backoff(4, &config), Duration::from_secs(10));
    }

    // ==================== WsChannel without a server ====================

    fn unreachable() -> ChannelConfig {
        let mut config = ChannelConfig::new("ws://127.0.0.1:1");
        config.reconnect.initial_delay = Duration::from_secs(60);
        config
    }

    #[tokio::test]
    async fn test_emit_before_connect_fails() {
        let channel = WsChannel::connect(unreachable());
        let result = channel.emit(ClientEvent::GetDocument("doc1".parse().unwrap()));
        assert_eq!(result, Err(ChannelError::NotConnected));
        assert_eq!(channel.connection_epoch(), None);
        channel.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_stops_task() {
        let channel = WsChannel::connect(unreachable());
        channel.disconnect();
        channel.disconnect();

        assert!(channel.is_closed());
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .expect("channel task should stop after disconnect");
        assert_eq!(
            channel.emit(ClientEvent::GetDocument("doc1".parse().unwrap())),
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut config = ChannelConfig::new("ws://127.0.0.1:1");
        config.reconnect.initial_delay = Duration::from_millis(10);
        config.reconnect.max_attempts = Some(2);
        let channel = WsChannel::connect(config);

        tokio::time::timeout(Duration::from_secs(10), channel.closed())
            .await
            .expect("channel should give up");
        assert!(channel.is_closed());
    }
}
