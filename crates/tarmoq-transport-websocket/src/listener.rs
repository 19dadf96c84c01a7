//! Agent-facing WebSocket listener
//!
//! Accepts TCP connections, performs the upgrade while capturing the
//! handshake headers, then hands each agent to the broker for the rest of its
//! life.

use std::net::SocketAddr;
use std::sync::Arc;
use tarmoq_control::{Broker, Handshake};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as WsProtocolConfig;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::connection::split_connection;

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
}

/// WebSocket listener for agent control channels
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(config: WebSocketConfig) -> Result<Self, WebSocketError> {
        let bind_addr = config.bind_addr;
        let tcp_listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| WebSocketError::BindError {
                    address: bind_addr.ip().to_string(),
                    port: bind_addr.port(),
                    reason: e.to_string(),
                })?;

        let local_addr = tcp_listener.local_addr()?;
        info!(
            "WebSocket listener bound to ws://{} (http: {}, tcp: {})",
            local_addr, config.http_path, config.tcp_path
        );

        Ok(Self {
            tcp_listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WebSocketError> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Accept agents until `shutdown` fires. Each agent runs on its own task.
    pub async fn serve(self, broker: Arc<Broker>, shutdown: CancellationToken) {
        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("WebSocket listener shutting down");
                    break;
                }
                accepted = self.tcp_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            debug!("Incoming TCP connection from {}", remote_addr);
            let broker = broker.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                handle_agent(tcp_stream, remote_addr, config, broker).await;
            });
        }
    }
}

async fn handle_agent(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<WebSocketConfig>,
    broker: Arc<Broker>,
) {
    let (handshake, ws_stream) = match accept_agent(tcp_stream, remote_addr, &config).await {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!("WebSocket handshake failed from {}: {}", remote_addr, e);
            return;
        }
    };

    info!(
        "WebSocket connection established from {} ({} tunnel)",
        remote_addr, handshake.protocol
    );

    let (sink, inbound) =
        split_connection(ws_stream, config.keep_alive_interval, config.outbound_queue);
    if let Err(e) = broker.run_session(handshake, sink, inbound).await {
        debug!("Session from {} ended: {}", remote_addr, e);
    }
}

/// Perform the websocket upgrade, capturing the headers the broker needs.
/// Paths other than the configured tunnel paths are refused with 404.
pub async fn accept_agent(
    tcp_stream: TcpStream,
    remote_addr: SocketAddr,
    config: &WebSocketConfig,
) -> Result<(Handshake, WebSocketStream<TcpStream>), WebSocketError> {
    let mut captured: Option<Handshake> = None;

    let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(protocol) = config.protocol_for_path(req.uri().path()) else {
            debug!("Refusing upgrade on {} from {}", req.uri().path(), remote_addr);
            let mut refused = ErrorResponse::new(Some("Not Found".to_string()));
            *refused.status_mut() = StatusCode::NOT_FOUND;
            return Err(refused);
        };

        captured = Some(handshake_from_headers(
            Handshake::new(protocol).with_remote_addr(remote_addr),
            req.headers(),
        ));
        Ok(response)
    };

    let mut ws_config = WsProtocolConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(tcp_stream, callback, Some(ws_config))
            .await
            .map_err(|e| WebSocketError::Handshake(e.to_string()))?;

    let handshake = captured
        .ok_or_else(|| WebSocketError::Handshake("upgrade completed without a request".into()))?;
    Ok((handshake, ws_stream))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Header names are matched case-insensitively
fn handshake_from_headers(mut handshake: Handshake, headers: &HeaderMap) -> Handshake {
    if let Some(authorization) = header(headers, "authorization") {
        handshake = handshake.with_authorization(authorization);
    }
    if let Some(subdomain) =
        header(headers, "subdomain").or_else(|| header(headers, "custom-subdomain"))
    {
        handshake = handshake.with_subdomain(subdomain);
    }
    handshake
}
