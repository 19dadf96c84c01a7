//! Broker orchestration
//!
//! Ties the registries together: authorizes and provisions a tunnel when an
//! agent connects, forwards public HTTP requests and correlates the replies,
//! relays TCP data frames, and tears everything down when the agent goes away.

use futures_util::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarmoq_auth::{
    extract_bearer, AuthError, Identity, QuotaError, QuotaLedger, TokenAuthorizer, UnlimitedQuota,
};
use tarmoq_proto::{
    CodecError, ControlCodec, ControlMessage, DataFrame, ForwardRequest, ForwardResponse,
    ResponseKind, UPSTREAM_UNAVAILABLE_HTML,
};
use tarmoq_router::{RegistryError, Tunnel, TunnelProtocol, TunnelRegistry};
use tarmoq_server_tcp_proxy::{ListenerPool, SessionUplink, TcpProxyServerError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::chunks::ChunkBuffer;
use crate::config::BrokerConfig;
use crate::pending_requests::{PendingRequests, SubmitError};
use crate::session::{
    ControlSink, Inbound, SessionError, SessionHandle, SessionId, SessionRegistry, SessionState,
    TransportError, WireFrame, TRANSPORT_CLOSE_TIMEOUT,
};

/// ERROR text sent for agent messages that are not valid JSON
const INVALID_FORMAT: &str = "Invalid response format";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    Allocation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Agent did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request cancelled: session closed")]
    Cancelled,

    #[error("Request quota exhausted for {0}")]
    QuotaExceeded(Identity),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the agent should be told to disconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Auth(_) | BrokerError::Capacity(_))
    }
}

impl From<RegistryError> for BrokerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Capacity { .. } => BrokerError::Capacity(e.to_string()),
            RegistryError::Allocation(_) => BrokerError::Allocation(e.to_string()),
            RegistryError::NotFound(_) => BrokerError::NotFound(e.to_string()),
        }
    }
}

impl From<SubmitError> for BrokerError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::NotFound(id) => BrokerError::NotFound(format!("session {}", id)),
            SubmitError::Timeout(after) => BrokerError::Timeout(after),
            SubmitError::Cancelled => BrokerError::Cancelled,
            SubmitError::Transport(reason) => BrokerError::Transport(reason),
        }
    }
}

impl From<SessionError> for BrokerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(id) => BrokerError::NotFound(format!("session {}", id)),
            SessionError::Transport(e) => BrokerError::Transport(e.to_string()),
            SessionError::Codec(e) => BrokerError::Protocol(e.to_string()),
        }
    }
}

impl From<CodecError> for BrokerError {
    fn from(e: CodecError) -> Self {
        BrokerError::Protocol(e.to_string())
    }
}

impl From<TcpProxyServerError> for BrokerError {
    fn from(e: TcpProxyServerError) -> Self {
        match e {
            TcpProxyServerError::BindError { .. } => BrokerError::Allocation(e.to_string()),
            _ => BrokerError::Transport(e.to_string()),
        }
    }
}

/// Metadata captured from the transport handshake that opened a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Raw `Authorization` header value
    pub authorization: Option<String>,
    /// `Subdomain` / `Custom-Subdomain` header value
    pub requested_subdomain: Option<String>,
    pub protocol: TunnelProtocol,
    pub remote_addr: Option<SocketAddr>,
}

impl Handshake {
    pub fn new(protocol: TunnelProtocol) -> Self {
        Self {
            authorization: None,
            requested_subdomain: None,
            protocol,
            remote_addr: None,
        }
    }

    pub fn http() -> Self {
        Self::new(TunnelProtocol::Http)
    }

    pub fn tcp() -> Self {
        Self::new(TunnelProtocol::Tcp)
    }

    pub fn with_bearer(mut self, token: &str) -> Self {
        self.authorization = Some(format!("Bearer {}", token));
        self
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn with_subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.requested_subdomain = Some(subdomain.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionRegistry>,
    tunnels: TunnelRegistry,
    listeners: ListenerPool,
    pending: PendingRequests,
    chunks: ChunkBuffer,
    authorizer: Arc<dyn TokenAuthorizer>,
    quota: Arc<dyn QuotaLedger>,
}

impl Broker {
    pub fn new(config: BrokerConfig, authorizer: Arc<dyn TokenAuthorizer>) -> Self {
        Self {
            tunnels: TunnelRegistry::new(config.port_range.clone(), config.tunnel_limits()),
            listeners: ListenerPool::with_config(config.listener.clone()),
            sessions: Arc::new(SessionRegistry::new()),
            pending: PendingRequests::new(),
            chunks: ChunkBuffer::new(),
            authorizer,
            quota: Arc::new(UnlimitedQuota),
            config,
        }
    }

    pub fn with_quota(mut self, quota: Arc<dyn QuotaLedger>) -> Self {
        self.quota = quota;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Authorize the agent, provision its tunnel and announce it with CREATED.
    ///
    /// On failure the agent is sent an ERROR (fatal for auth and capacity) and
    /// the channel is closed.
    pub async fn open_session(
        &self,
        handshake: Handshake,
        mut sink: Box<dyn ControlSink>,
    ) -> Result<SessionId, BrokerError> {
        let session_id = Uuid::new_v4().to_string();
        debug!(
            "Session {} connected from {:?} ({} tunnel requested)",
            session_id, handshake.remote_addr, handshake.protocol
        );

        let identity = match self.authorize(&handshake).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Rejecting session {}: {}", session_id, e);
                reject(sink.as_mut(), &e).await;
                return Err(e);
            }
        };

        let session = Arc::new(SessionHandle::new(session_id.clone(), identity.clone(), sink));
        session.set_state(SessionState::Provisioning);
        self.sessions.register(session.clone());

        let tunnel = match self.provision(&session_id, &identity, &handshake).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Provisioning failed for session {}: {}", session_id, e);
                let error = ControlMessage::error(e.to_string(), e.is_fatal());
                if let Err(send_err) = session.send_message(&error).await {
                    debug!("Could not deliver ERROR to {}: {}", session_id, send_err);
                }
                self.close_session(&session_id).await;
                return Err(e);
            }
        };

        let public_url = tunnel.public_url(&self.config.public_host);
        if let Err(e) = session.send_message(&ControlMessage::created(&public_url)).await {
            warn!("Failed to send CREATED to session {}: {}", session_id, e);
            self.close_session(&session_id).await;
            return Err(e.into());
        }

        session.set_state(SessionState::Active);
        info!(
            "Session {} for {} is active at {}",
            session_id, identity, public_url
        );
        Ok(session_id)
    }

    async fn authorize(&self, handshake: &Handshake) -> Result<Identity, BrokerError> {
        let token = extract_bearer(handshake.authorization.as_deref())?;
        Ok(self.authorizer.authorize(token).await?)
    }

    async fn provision(
        &self,
        session_id: &str,
        identity: &Identity,
        handshake: &Handshake,
    ) -> Result<Tunnel, BrokerError> {
        match handshake.protocol {
            TunnelProtocol::Http => Ok(self.tunnels.create_http(
                session_id,
                identity,
                handshake.requested_subdomain.as_deref(),
            )?),
            TunnelProtocol::Tcp => {
                let tunnel = self.tunnels.reserve_tcp(session_id, identity)?;
                if let Some(port) = tunnel.port() {
                    let uplink: Arc<dyn SessionUplink> = self.sessions.clone();
                    if let Err(e) = self
                        .listeners
                        .bind(session_id, self.config.tcp_bind_ip, port, uplink)
                        .await
                    {
                        self.tunnels.deactivate(&tunnel.tunnel_id);
                        return Err(e.into());
                    }
                }
                Ok(tunnel)
            }
        }
    }

    /// Process one inbound event from a session's reader
    pub async fn handle_frame(&self, session_id: &str, inbound: Inbound) {
        match inbound {
            Inbound::Keepalive => trace!("Keepalive from session {}", session_id),
            Inbound::Text(text) => self.handle_text(session_id, &text).await,
            Inbound::Binary(data) => match DataFrame::decode(&data) {
                Ok(frame) => self.deliver(session_id, frame).await,
                Err(e) => {
                    warn!("Malformed data frame from session {}: {}", session_id, e);
                    self.send_error(session_id, &e.to_string()).await;
                }
            },
        }
    }

    async fn deliver(&self, session_id: &str, frame: DataFrame) {
        let channel_id = frame.channel_id;
        match self.listeners.deliver(session_id, frame) {
            Ok(()) => {}
            Err(TcpProxyServerError::PeerOverloaded(_)) => {
                // The peer is gone; tell the agent to stop sending for it
                if let Err(e) = self
                    .sessions
                    .send_data(session_id, DataFrame::close(channel_id))
                    .await
                {
                    debug!("Could not close channel {} on {}: {}", channel_id, session_id, e);
                }
            }
            Err(e) => debug!("Dropping data frame from session {}: {}", session_id, e),
        }
    }

    async fn handle_text(&self, session_id: &str, text: &str) {
        let response = match ControlCodec::decode_response(text) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed message from session {}: {}", session_id, e);
                let message = match e {
                    CodecError::Json(_) => INVALID_FORMAT.to_string(),
                    other => other.to_string(),
                };
                self.send_error(session_id, &message).await;
                return;
            }
        };

        match response.kind {
            ResponseKind::Normal => self.complete(session_id, response),
            ResponseKind::Chunk => {
                if !self.pending.is_pending(session_id, &response.request_id) {
                    self.chunks.discard(session_id, &response.request_id);
                    debug!(
                        "Dropping chunk for request {} no longer pending on {}",
                        response.request_id, session_id
                    );
                    return;
                }
                self.chunks.add(session_id, &response);
                if response.last {
                    if let Some(full) = self.chunks.take_complete(session_id, &response.request_id)
                    {
                        self.complete(session_id, full);
                    }
                }
            }
            ResponseKind::UpstreamUnavailable => {
                debug!(
                    "Agent on session {} reports its local service is down",
                    session_id
                );
                let synthesized = ForwardResponse::new(
                    response.request_id,
                    500,
                    UPSTREAM_UNAVAILABLE_HTML,
                )
                .with_header("Content-Type", "text/html; charset=utf-8");
                self.complete(session_id, synthesized);
            }
        }
    }

    fn complete(&self, session_id: &str, response: ForwardResponse) {
        let request_id = response.request_id.clone();
        if !self.pending.complete(session_id, response) {
            debug!("Discarded late or unknown response {}", request_id);
        }
    }

    /// Non-fatal ERROR; the session stays open
    async fn send_error(&self, session_id: &str, message: &str) {
        let error = ControlMessage::error(message, false);
        if let Err(e) = self.sessions.send_message(session_id, &error).await {
            debug!("Could not send ERROR to session {}: {}", session_id, e);
        }
    }

    /// Tear a session down: mark it closed, cancel requests waiting on it,
    /// drop partial chunks, deactivate its tunnel and finally close its channel.
    /// Idempotent.
    ///
    /// Nothing before the transport close waits on the session's writer, and that
    /// close is bounded, so a stuck agent cannot hold its tunnel open.
    pub async fn close_session(&self, session_id: &str) {
        if let Ok(session) = self.sessions.lookup(session_id) {
            session.begin_close();
        }
        let cancelled = self.pending.cancel_session(session_id);
        let dropped = self.chunks.clear_session(session_id);

        if let Ok(tunnel) = self.tunnels.lookup_by_session(session_id) {
            self.deactivate_tunnel(&tunnel.tunnel_id).await;
        }

        let removed = self.sessions.remove(session_id).await;
        if removed.is_some() {
            info!(
                "Session {} closed ({} pending cancelled, {} partial response(s) dropped)",
                session_id, cancelled, dropped
            );
        }
    }

    /// Drive a session: open it, read until the channel ends, goes quiet for
    /// longer than the keepalive grace, or is closed elsewhere, then tear down.
    pub async fn run_session<S>(
        &self,
        handshake: Handshake,
        sink: Box<dyn ControlSink>,
        mut inbound: S,
    ) -> Result<(), BrokerError>
    where
        S: Stream<Item = Result<Inbound, TransportError>> + Unpin + Send,
    {
        let session_id = self.open_session(handshake, sink).await?;
        let session = self.sessions.lookup(&session_id)?;
        let grace = self.config.keepalive_grace;

        loop {
            let next = tokio::select! {
                _ = session.closed() => {
                    debug!("Session {} closed by broker", session_id);
                    break;
                }
                next = tokio::time::timeout(grace, inbound.next()) => next,
            };

            match next {
                Ok(Some(Ok(frame))) => self.handle_frame(&session_id, frame).await,
                Ok(Some(Err(e))) => {
                    warn!("Session {} read error: {}", session_id, e);
                    break;
                }
                Ok(None) => {
                    debug!("Session {} ended by agent", session_id);
                    break;
                }
                Err(_) => {
                    warn!(
                        "Session {} silent for {:?}, treating as disconnected",
                        session_id, grace
                    );
                    break;
                }
            }
        }

        self.close_session(&session_id).await;
        Ok(())
    }

    /// Forward a public HTTP request to the tunnel bound to `routing_key` and
    /// wait for the agent's reply
    pub async fn route_http(
        &self,
        routing_key: &str,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, BrokerError> {
        let tunnel = self.tunnels.lookup_by_subdomain(routing_key)?;
        trace!(
            "Routing {} {} to session {}",
            request.method,
            request.path,
            tunnel.session_id
        );

        match self.quota.check(&tunnel.owner).await {
            Ok(_) => {}
            Err(QuotaError::Exceeded(owner)) => {
                debug!("Refusing request for {}: quota exhausted", owner);
                return Err(BrokerError::QuotaExceeded(owner));
            }
            Err(e) => warn!("Quota check failed, forwarding anyway: {}", e),
        }

        let quota = self.quota.clone();
        let owner = tunnel.owner.clone();
        tokio::spawn(async move {
            match quota.decrement(&owner).await {
                Ok(remaining) => trace!("{} has {} request(s) left", owner, remaining),
                Err(e) => warn!("Quota decrement failed: {}", e),
            }
        });

        let result = self
            .pending
            .submit(
                &self.sessions,
                &tunnel.session_id,
                request,
                self.config.request_timeout,
            )
            .await;

        if let Err(SubmitError::Timeout(_)) = result {
            let pruned = self.chunks.retain_session(&tunnel.session_id, |request_id| {
                self.pending.is_pending(&tunnel.session_id, request_id)
            });
            if pruned > 0 {
                debug!(
                    "Dropped {} abandoned partial response(s) on {}",
                    pruned, tunnel.session_id
                );
            }
        }
        result.map_err(BrokerError::from)
    }

    /// Remove a tunnel, closing its listener and peers first for TCP. Idempotent.
    pub async fn deactivate_tunnel(&self, tunnel_id: &str) -> Option<Tunnel> {
        let tunnel = self.tunnels.get(tunnel_id).ok()?;
        if let Some(port) = tunnel.port() {
            self.listeners.unbind(port).await;
        }
        self.tunnels.deactivate(tunnel_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    /// Chunked responses still being reassembled
    pub fn partial_response_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.tunnels()
    }

    pub fn tunnel_for_session(&self, session_id: &str) -> Option<Tunnel> {
        self.tunnels.lookup_by_session(session_id).ok()
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.lookup(session_id).ok().map(|s| s.state())
    }

    pub fn listeners(&self) -> &ListenerPool {
        &self.listeners
    }

    pub fn port_is_free(&self, port: u16) -> bool {
        self.tunnels.ports().is_free(port)
    }
}

/// Refuse a connection that never became a session
async fn reject(sink: &mut dyn ControlSink, error: &BrokerError) {
    let msg = ControlMessage::error(error.to_string(), error.is_fatal());
    let refused = async {
        match ControlCodec::encode(&msg) {
            Ok(text) => {
                if let Err(e) = sink.send(WireFrame::Text(text)).await {
                    debug!("Could not deliver rejection: {}", e);
                }
            }
            Err(e) => debug!("Could not encode rejection: {}", e),
        }
        let _ = sink.close().await;
    };
    if tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, refused).await.is_err() {
        warn!("Rejected agent did not close within {:?}", TRANSPORT_CLOSE_TIMEOUT);
    }
}
