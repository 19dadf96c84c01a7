//! Agent session management
//!
//! A session is one live control channel to one agent. Writes to a session are
//! serialized through the session's writer mutex; it is the only lock held
//! across I/O anywhere in the broker.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tarmoq_auth::Identity;
use tarmoq_proto::{CodecError, ControlCodec, ControlMessage, DataFrame};
use tarmoq_server_tcp_proxy::{SessionUplink, UplinkError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub type SessionId = String;

/// Outbound message on a control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

/// Inbound event from a control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    /// Transport-level liveness signal (ping/pong); carries no payload
    Keepalive,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Io(String),
}

/// Write half of a control channel
#[async_trait]
pub trait ControlSink: Send + 'static {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(SessionId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Provisioning,
    Active,
    Closed,
}

/// Upper bound on flushing a close through a sink that has stopped draining
pub const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SessionHandle {
    pub id: SessionId,
    pub identity: Identity,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    writer: tokio::sync::Mutex<Box<dyn ControlSink>>,
    closed: AtomicBool,
    transport_closed: AtomicBool,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: SessionId, identity: Identity, sink: Box<dyn ControlSink>) -> Self {
        Self {
            id,
            identity,
            created_at: Utc::now(),
            state: Mutex::new(SessionState::Connected),
            writer: tokio::sync::Mutex::new(sink),
            closed: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    pub fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            // Closed is terminal
            if *state != SessionState::Closed {
                *state = next;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been closed
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Write one frame. Gives up with [`TransportError::Closed`] as soon as the
    /// session shuts down, even if the sink is stuck mid-write.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.send(frame).await
            } => result,
        }
    }

    pub async fn send_message(&self, msg: &ControlMessage) -> Result<(), SessionError> {
        let text = ControlCodec::encode(msg)?;
        trace!("Session {} <- {}", self.id, text);
        self.send(WireFrame::Text(text)).await?;
        Ok(())
    }

    /// Mark the session closed and wake everything waiting on it, including
    /// in-flight sends. Does not touch the transport. Returns `true` for the
    /// first caller only.
    pub fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.set_state(SessionState::Closed);
        self.shutdown.cancel();
        true
    }

    /// Close the underlying channel, waiting at most [`TRANSPORT_CLOSE_TIMEOUT`]
    pub async fn close_transport(&self) {
        if self.transport_closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let close = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing session {}: {}", self.id, e),
            Err(_) => warn!(
                "Session {} did not close within {:?}, abandoning transport",
                self.id, TRANSPORT_CLOSE_TIMEOUT
            ),
        }
    }

    /// Shut the session down and close its channel. Idempotent.
    pub async fn close(&self) {
        self.begin_close();
        self.close_transport().await;
    }
}

/// Live sessions by id
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn register(&self, handle: Arc<SessionHandle>) {
        debug!("Registering session {} ({})", handle.id, handle.identity);
        self.sessions.insert(handle.id.clone(), handle);
    }

    pub fn lookup(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub async fn send(&self, session_id: &str, frame: WireFrame) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        session.send(frame).await?;
        Ok(())
    }

    pub async fn send_message(&self, session_id: &str, msg: &ControlMessage) -> Result<(), SessionError> {
        self.lookup(session_id)?.send_message(msg).await
    }

    /// Remove a session and close its channel. Idempotent.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        let (_, session) = self.sessions.remove(session_id)?;
        session.close().await;
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionUplink for SessionRegistry {
    async fn send_data(&self, session_id: &str, frame: DataFrame) -> Result<(), UplinkError> {
        let bytes = frame.encode().map_err(|e| UplinkError(e.to_string()))?;
        self.send(session_id, WireFrame::Binary(bytes))
            .await
            .map_err(|e| UplinkError(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// What a recording sink observed
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Frame(WireFrame),
        Closed,
    }

    /// Sink that forwards everything to a channel
    pub struct RecordingSink {
        pub tx: mpsc::UnboundedSender<Sent>,
    }

    #[async_trait]
    impl ControlSink for RecordingSink {
        async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
            self.tx
                .send(Sent::Frame(frame))
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            let _ = self.tx.send(Sent::Closed);
            Ok(())
        }
    }

    pub fn recording_sink() -> (Box<dyn ControlSink>, mpsc::UnboundedReceiver<Sent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(RecordingSink { tx }), rx)
    }

    /// Sink that takes `accept` frames and then never finishes another write
    /// or close, like a peer that stopped reading
    pub struct StallingSink {
        pub tx: mpsc::UnboundedSender<Sent>,
        pub accept: usize,
    }

    #[async_trait]
    impl ControlSink for StallingSink {
        async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
            if self.accept == 0 {
                return std::future::pending().await;
            }
            self.accept -= 1;
            self.tx
                .send(Sent::Frame(frame))
                .map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            std::future::pending().await
        }
    }

    pub fn stalling_sink(accept: usize) -> (Box<dyn ControlSink>, mpsc::UnboundedReceiver<Sent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(StallingSink { tx, accept }), rx)
    }
}
