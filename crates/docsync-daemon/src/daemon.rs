//! The relay server's event loop.
//!
//! One task owns the listener, every connection and the relay, so client
//! events are handled strictly one at a time in the order they are polled.

use crate::config::ServerConfig;
use crate::relay::{Delivery, Relay};
use crate::server::{HubEvent, WebSocketServer};
use anyhow::Result;
use docsync_core::DocumentStore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    server: WebSocketServer,
    relay: Relay,
}

impl Daemon {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            server: WebSocketServer::new(),
            relay: Relay::new(store),
        }
    }

    async fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            if let Err(e) = self.server.send(&delivery.conn_id, &delivery.event).await {
                warn!(
                    "Failed to send {} to {}: {}",
                    delivery.event.name(),
                    delivery.conn_id,
                    e
                );
            }
        }
    }

    async fn on_hub_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { conn_id, addr } => {
                debug!("Client {} connected from {}", conn_id, addr);
            }
            HubEvent::Event { conn_id, event } => {
                let deliveries = self.relay.handle(&conn_id, event).await;
                self.deliver(deliveries).await;
            }
            HubEvent::Disconnected { conn_id } => {
                let deliveries = self.relay.disconnected(&conn_id);
                self.deliver(deliveries).await;
            }
        }
    }

    async fn flush(&mut self) {
        let deliveries = self.relay.flush().await;
        self.deliver(deliveries).await;
    }

    /// Serve until `shutdown` resolves, then save everything and close all
    /// connections.
    pub async fn run(
        mut self,
        listener: TcpListener,
        config: &ServerConfig,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut save_timer = tokio::time::interval(config.save_interval);
        save_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Relay running on {}", listener.local_addr()?);
        match self.relay.stored_documents().await {
            Ok(ids) => info!("{} stored documents", ids.len()),
            Err(e) => warn!("Could not list stored documents: {}", e),
        }

        loop {
            tokio::select! {
                // Accept new WebSocket connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // Handle client events and disconnects
                Some(event) = self.server.poll_event() => {
                    self.on_hub_event(event).await;
                }

                // Periodic save
                _ = save_timer.tick() => {
                    self.flush().await;
                }

                // Handle graceful shutdown
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.flush().await;
        self.server.close_all().await;
        info!("Relay stopped");
        Ok(())
    }
}
