//! Tunnel routing state
//!
//! Holds every active tunnel, keyed by the routing key public traffic arrives
//! with (a subdomain for HTTP, a port for TCP), and enforces the per-identity
//! tunnel caps. TCP ports come from a fixed [`PortPool`].

pub mod ports;
pub mod registry;
pub mod subdomain;
pub mod tunnel;

pub use ports::PortPool;
pub use registry::{AllocationError, RegistryError, TunnelLimits, TunnelRegistry};
pub use subdomain::{generate_subdomain, normalize_subdomain, validate_subdomain};
pub use tunnel::{Tunnel, TunnelId, TunnelKind, TunnelProtocol};

use std::fmt;

/// Route key for locating a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// HTTP routing by subdomain label
    Subdomain(String),
    /// TCP routing by public port
    Port(u16),
    /// Reverse lookup by owning session
    Session(String),
    Tunnel(TunnelId),
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKey::Subdomain(s) => write!(f, "subdomain '{}'", s),
            RouteKey::Port(p) => write!(f, "port {}", p),
            RouteKey::Session(id) => write!(f, "session {}", id),
            RouteKey::Tunnel(id) => write!(f, "tunnel {}", id),
        }
    }
}
