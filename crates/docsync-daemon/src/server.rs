//! WebSocket server for accepting client connections.
//!
//! Owns every live connection and turns raw frames into typed
//! `ClientEvent`s. Callers only see `HubEvent`s via `poll_event()`;
//! malformed frames are logged and dropped here.

use crate::connection::{ClientConnection, ConnectionEvent};
use anyhow::Result;
use docsync_core::{ClientEvent, ServerEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Event emitted by the server.
#[derive(Debug)]
pub enum HubEvent {
    /// A client finished the WebSocket upgrade.
    Connected { conn_id: String, addr: SocketAddr },
    /// A well-formed event from a client.
    Event { conn_id: String, event: ClientEvent },
    /// A client went away.
    Disconnected { conn_id: String },
}

/// How long a client may take to complete the WebSocket upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Upgraded = (WebSocketStream<TcpStream>, SocketAddr);

/// WebSocket server managing client connections.
pub struct WebSocketServer {
    connections: HashMap<String, ClientConnection>,
    /// Counter for generating connection IDs
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Streams whose upgrade finished in a handshake task
    upgraded_tx: mpsc::UnboundedSender<Upgraded>,
    upgraded_rx: mpsc::UnboundedReceiver<Upgraded>,
}

enum Incoming {
    Upgraded(Option<Upgraded>),
    Connection(Option<ConnectionEvent>),
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, upgraded_rx) = mpsc::unbounded_channel();

        Self {
            connections: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
            upgraded_tx,
            upgraded_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Handle a new incoming TCP connection.
    ///
    /// The WebSocket upgrade runs in its own task, bounded by
    /// `HANDSHAKE_TIMEOUT`; the connection shows up as `HubEvent::Connected`
    /// from `poll_event` once it completes.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgraded_tx = self.upgraded_tx.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
                Ok(Ok(ws)) => {
                    let _ = upgraded_tx.send((ws, addr));
                }
                Ok(Err(e)) => {
                    // Health checks (like `nc -z`) connect and close without
                    // completing the WebSocket handshake.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
                Err(_) => {
                    warn!("WebSocket upgrade from {} timed out", addr);
                }
            }
        });
    }

    fn register(&mut self, ws_stream: WebSocketStream<TcpStream>, addr: SocketAddr) -> String {
        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        info!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = ClientConnection::new(conn_id.clone(), ws_stream, self.event_tx.clone());
        self.connections.insert(conn_id.clone(), conn);
        conn_id
    }

    /// Wait for the next event from any connection.
    pub async fn poll_event(&mut self) -> Option<HubEvent> {
        loop {
            let incoming = tokio::select! {
                upgraded = self.upgraded_rx.recv() => Incoming::Upgraded(upgraded),
                event = self.event_rx.recv() => Incoming::Connection(event),
            };

            match incoming {
                Incoming::Upgraded(upgraded) => {
                    let (ws_stream, addr) = upgraded?;
                    let conn_id = self.register(ws_stream, addr);
                    return Some(HubEvent::Connected { conn_id, addr });
                }
                Incoming::Connection(event) => match event? {
                    ConnectionEvent::Frame { conn_id, data } => {
                        match ClientEvent::from_frame(&data) {
                            Ok(event) => {
                                debug!("{} from {}", event.name(), conn_id);
                                return Some(HubEvent::Event { conn_id, event });
                            }
                            Err(e) => {
                                warn!("Dropping frame from {}: {}", conn_id, e);
                            }
                        }
                    }
                    ConnectionEvent::Closed { conn_id } => {
                        if self.connections.remove(&conn_id).is_none() {
                            // Already closed by us.
                            continue;
                        }
                        info!("Connection closed: {}", conn_id);
                        return Some(HubEvent::Disconnected { conn_id });
                    }
                },
            }
        }
    }

    /// Send an event to one connection.
    pub async fn send(&self, conn_id: &str, event: &ServerEvent) -> Result<()> {
        let conn = self
            .connections
            .get(conn_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown connection: {}", conn_id))?;

        conn.send_text(event.to_frame()?).await
    }

    /// Close a connection from our side. No `Disconnected` event follows.
    pub async fn close(&mut self, conn_id: &str) {
        if let Some(mut conn) = self.connections.remove(conn_id) {
            conn.close().await;
        }
    }

    /// Close every connection.
    pub async fn close_all(&mut self) {
        for (_, mut conn) in self.connections.drain() {
            conn.close().await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
