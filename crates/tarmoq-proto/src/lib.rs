//! Tunnel Protocol Definitions
//!
//! This crate defines the control-plane messages exchanged between the broker and
//! its agents, the JSON codec for them, and the binary framing used by the TCP
//! data plane.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use frame::{ChannelId, DataFrame, FrameError};
pub use messages::*;

/// Maximum data-plane frame payload (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How long a forwarded request waits for the agent's reply
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Interval at which agents are expected to emit a keepalive
pub const KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// First port handed out to TCP tunnels
pub const DEFAULT_MIN_PORT: u16 = 50000;

/// Last port (inclusive) handed out to TCP tunnels
pub const DEFAULT_MAX_PORT: u16 = 51000;

/// Active HTTP tunnels allowed per identity
pub const DEFAULT_HTTP_TUNNEL_LIMIT: usize = 3;

/// Active TCP tunnels allowed per identity
pub const DEFAULT_TCP_TUNNEL_LIMIT: usize = 1;

/// Body returned to the public caller when the agent reports its local service is down
pub const UPSTREAM_UNAVAILABLE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Not Running App</title>
</head>
<body>
    <h1>Application Not Running</h1>
    <p>It seems that the application you are trying to access is not running.</p>
    <p>Please check the application status or contact support.</p>
</body>
</html>
"#;
