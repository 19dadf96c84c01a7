//! WebSocket transport configuration

use std::net::SocketAddr;
use std::time::Duration;
use tarmoq_control::TunnelProtocol;

/// Largest control message accepted from an agent
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub bind_addr: SocketAddr,

    /// Upgrade path for HTTP tunnel agents
    pub http_path: String,

    /// Upgrade path for TCP tunnel agents
    pub tcp_path: String,

    /// Interval between server-initiated ping frames
    pub keep_alive_interval: Duration,

    pub max_message_size: usize,

    /// Queued outbound messages per connection
    pub outbound_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            http_path: "/server".to_string(),
            tcp_path: "/tcp".to_string(),
            keep_alive_interval: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_queue: 256,
        }
    }
}

impl WebSocketConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_paths(mut self, http_path: impl Into<String>, tcp_path: impl Into<String>) -> Self {
        self.http_path = http_path.into();
        self.tcp_path = tcp_path.into();
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Tunnel variant served on `path`; a trailing slash is tolerated
    pub fn protocol_for_path(&self, path: &str) -> Option<TunnelProtocol> {
        let path = match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed,
            _ => path,
        };

        if path == self.http_path {
            Some(TunnelProtocol::Http)
        } else if path == self.tcp_path {
            Some(TunnelProtocol::Tcp)
        } else {
            None
        }
    }
}
