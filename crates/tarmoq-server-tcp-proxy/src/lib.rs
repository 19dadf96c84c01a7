//! TCP Listener Pool
//!
//! Every active TCP tunnel owns one listening socket. Each peer accepted on it is
//! given a channel id and its bytes are relayed, framed with that id, over the
//! owning session's control channel through a [`SessionUplink`].

mod server;
mod task_tracker;

pub use server::{
    ChannelIdGenerator, ListenerPool, ListenerPoolConfig, SessionUplink, TcpProxyServerError,
    UplinkError,
};
pub use task_tracker::TaskTracker;
