//! Broker configuration

use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;
use tarmoq_proto::{
    DEFAULT_HTTP_TUNNEL_LIMIT, DEFAULT_MAX_PORT, DEFAULT_MIN_PORT, DEFAULT_REQUEST_TIMEOUT_SECS,
    DEFAULT_TCP_TUNNEL_LIMIT, KEEPALIVE_INTERVAL_SECS,
};
use tarmoq_router::TunnelLimits;
use tarmoq_server_tcp_proxy::ListenerPoolConfig;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Host used when minting public URLs
    pub public_host: String,
    pub http_tunnel_cap: usize,
    pub tcp_tunnel_cap: usize,
    /// How long a forwarded request waits for the agent
    pub request_timeout: Duration,
    /// Silence after which a session counts as disconnected
    pub keepalive_grace: Duration,
    pub port_range: RangeInclusive<u16>,
    /// Address TCP tunnel listeners bind on
    pub tcp_bind_ip: IpAddr,
    pub listener: ListenerPoolConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            http_tunnel_cap: DEFAULT_HTTP_TUNNEL_LIMIT,
            tcp_tunnel_cap: DEFAULT_TCP_TUNNEL_LIMIT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            keepalive_grace: Duration::from_secs(KEEPALIVE_INTERVAL_SECS * 3),
            port_range: DEFAULT_MIN_PORT..=DEFAULT_MAX_PORT,
            tcp_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listener: ListenerPoolConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = host.into();
        self
    }

    pub fn with_tunnel_caps(mut self, http: usize, tcp: usize) -> Self {
        self.http_tunnel_cap = http;
        self.tcp_tunnel_cap = tcp;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_keepalive_grace(mut self, grace: Duration) -> Self {
        self.keepalive_grace = grace;
        self
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_tcp_bind_ip(mut self, ip: IpAddr) -> Self {
        self.tcp_bind_ip = ip;
        self
    }

    pub fn with_listener_config(mut self, listener: ListenerPoolConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn tunnel_limits(&self) -> TunnelLimits {
        TunnelLimits {
            http: self.http_tunnel_cap,
            tcp: self.tcp_tunnel_cap,
        }
    }
}
