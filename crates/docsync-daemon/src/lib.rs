//! docsync-daemon library: the WebSocket relay server, the native channel
//! client, and the file-backed document store.
//!
//! The `docsync` binary is a thin layer over these modules; integration
//! tests use them directly.

pub mod client;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod outgoing;
pub mod relay;
pub mod server;
pub mod store;

// Re-export key types for convenience
pub use config::{ClientConfig, ServerConfig};
pub use daemon::Daemon;
pub use outgoing::{calculate_backoff, ChannelConfig, ReconnectConfig, WsChannel};
pub use relay::{Delivery, Relay};
pub use server::{HubEvent, WebSocketServer};
pub use store::FileStore;
