use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Bearer token for the command routes. `None` disables auth.
    #[serde(skip)]
    pub auth_token: Option<SecretString>,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub max_send_queue: usize,
    /// Inbound frames buffered for the dispatcher across all connections.
    pub inbound_queue: usize,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Connections silent for longer than this are dropped.
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            auth_token: None,
            max_send_queue: 256,
            inbound_queue: 1024,
            request_timeout_ms: 30_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}
