//! Tunnel records

use chrono::{DateTime, Utc};
use std::fmt;
use tarmoq_auth::Identity;

use crate::RouteKey;

pub type TunnelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelProtocol {
    Http,
    Tcp,
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelProtocol::Http => f.write_str("http"),
            TunnelProtocol::Tcp => f.write_str("tcp"),
        }
    }
}

/// Routing binding of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelKind {
    Http { subdomain: String },
    Tcp { port: u16 },
}

impl TunnelKind {
    pub fn protocol(&self) -> TunnelProtocol {
        match self {
            TunnelKind::Http { .. } => TunnelProtocol::Http,
            TunnelKind::Tcp { .. } => TunnelProtocol::Tcp,
        }
    }
}

/// An active tunnel, owned by exactly one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub tunnel_id: TunnelId,
    pub session_id: String,
    pub owner: Identity,
    pub created_at: DateTime<Utc>,
    pub kind: TunnelKind,
}

impl Tunnel {
    pub fn protocol(&self) -> TunnelProtocol {
        self.kind.protocol()
    }

    pub fn route_key(&self) -> RouteKey {
        match &self.kind {
            TunnelKind::Http { subdomain } => RouteKey::Subdomain(subdomain.clone()),
            TunnelKind::Tcp { port } => RouteKey::Port(*port),
        }
    }

    pub fn subdomain(&self) -> Option<&str> {
        match &self.kind {
            TunnelKind::Http { subdomain } => Some(subdomain),
            TunnelKind::Tcp { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self.kind {
            TunnelKind::Tcp { port } => Some(port),
            TunnelKind::Http { .. } => None,
        }
    }

    /// Public address announced to the agent in CREATED
    pub fn public_url(&self, public_host: &str) -> String {
        match &self.kind {
            TunnelKind::Http { subdomain } => format!("https://{}.{}/", subdomain, public_host),
            TunnelKind::Tcp { port } => format!("tcp://{}:{}", public_host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(kind: TunnelKind) -> Tunnel {
        Tunnel {
            tunnel_id: "t-1".to_string(),
            session_id: "s-1".to_string(),
            owner: Identity::new("alice"),
            created_at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_public_urls() {
        let http = tunnel(TunnelKind::Http {
            subdomain: "abcd1234".to_string(),
        });
        assert_eq!(
            http.public_url("tarmoq.dev"),
            "https://abcd1234.tarmoq.dev/"
        );
        assert_eq!(http.protocol(), TunnelProtocol::Http);

        let tcp = tunnel(TunnelKind::Tcp { port: 50007 });
        assert_eq!(tcp.public_url("tarmoq.dev"), "tcp://tarmoq.dev:50007");
        assert_eq!(tcp.route_key(), RouteKey::Port(50007));
        assert_eq!(tcp.subdomain(), None);
    }
}
