//! Control plane for the tunnel broker
//!
//! Owns agent sessions, the table of requests waiting on agents, chunked
//! response reassembly, and the [`Broker`] that orchestrates them together with
//! the tunnel registry and the TCP listener pool.

pub mod broker;
pub mod chunks;
pub mod config;
pub mod pending_requests;
pub mod session;

pub use broker::{Broker, BrokerError, Handshake};
pub use chunks::ChunkBuffer;
pub use config::BrokerConfig;
pub use pending_requests::{PendingRequests, SubmitError};
pub use session::{
    ControlSink, Inbound, SessionError, SessionHandle, SessionId, SessionRegistry, SessionState,
    TransportError, WireFrame,
};

pub use tarmoq_router::{Tunnel, TunnelKind, TunnelProtocol};
