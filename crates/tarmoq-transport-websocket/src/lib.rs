//! WebSocket transport for agent control channels
//!
//! Agents connect with a websocket upgrade on one of two paths, one per
//! tunnel kind, carrying their credentials and an optional subdomain in the
//! upgrade headers. Text messages carry JSON control traffic; binary messages
//! carry TCP data-plane frames.

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::WebSocketConfig;
pub use connection::{split_connection, WsControlSink};
pub use listener::{accept_agent, WebSocketError, WebSocketListener};
pub use stream::{inbound_stream, InboundStream};
