//! Typed configuration for the relay server and the terminal client.

use crate::outgoing::{ChannelConfig, ReconnectConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Relay server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on for client connections
    pub listen: String,
    /// Directory holding one JSON file per document
    pub data_dir: PathBuf,
    /// How often changed documents are saved
    pub save_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3001".to_string(),
            data_dir: PathBuf::from("documents"),
            save_interval: Duration::from_secs(2),
        }
    }
}

/// Terminal client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay endpoint
    pub server_url: String,
    /// Public address of the web app, used for share links
    pub app_url: String,
    pub cookie: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:3001".to_string(),
            app_url: "http://localhost:3000".to_string(),
            cookie: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn channel(&self) -> ChannelConfig {
        ChannelConfig {
            url: self.server_url.clone(),
            cookie: self.cookie.clone(),
            reconnect: self.reconnect.clone(),
        }
    }
}
