//! Listener pool implementation
//!
//! One accept loop per bound tunnel port. Each accepted peer runs a single relay
//! task that selects between bytes read from the peer (sent upstream as data
//! frames) and bytes queued for it by the agent (written back to the peer).
//! Dropping a peer's queue sender closes that peer.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tarmoq_proto::{ChannelId, DataFrame};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::task_tracker::TaskTracker;

#[derive(Debug, Error)]
pub enum TcpProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("Channel {0} dropped: peer is not reading")]
    PeerOverloaded(ChannelId),
}

/// Failure to hand a frame to a session's control channel
#[derive(Debug, Error)]
#[error("Uplink error: {0}")]
pub struct UplinkError(pub String);

/// Path from the listener pool back to the agent owning a tunnel
#[async_trait]
pub trait SessionUplink: Send + Sync + 'static {
    async fn send_data(&self, session_id: &str, frame: DataFrame) -> Result<(), UplinkError>;
}

/// Channel id generator shared by every listener
#[derive(Clone)]
pub struct ChannelIdGenerator {
    next_channel_id: Arc<AtomicU32>,
}

impl ChannelIdGenerator {
    pub fn new() -> Self {
        Self {
            next_channel_id: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn generate(&self) -> ChannelId {
        self.next_channel_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for ChannelIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ListenerPoolConfig {
    /// Bind attempts when the port is still in use (e.g. TIME_WAIT)
    pub bind_attempts: u32,
    pub bind_retry_delay: Duration,
    /// Queued agent → peer writes; a peer that lets this fill up is dropped
    pub peer_queue_capacity: usize,
    pub read_buffer_size: usize,
}

impl Default for ListenerPoolConfig {
    fn default() -> Self {
        Self {
            bind_attempts: 3,
            bind_retry_delay: Duration::from_millis(200),
            peer_queue_capacity: 256,
            read_buffer_size: 8192,
        }
    }
}

struct PeerHandle {
    port: u16,
    session_id: String,
    tx: mpsc::Sender<Bytes>,
}

type PeerMap = Arc<DashMap<ChannelId, PeerHandle>>;

pub struct ListenerPool {
    config: ListenerPoolConfig,
    peers: PeerMap,
    listeners: TaskTracker,
    channel_ids: ChannelIdGenerator,
}

impl ListenerPool {
    pub fn new() -> Self {
        Self::with_config(ListenerPoolConfig::default())
    }

    pub fn with_config(config: ListenerPoolConfig) -> Self {
        Self {
            config,
            peers: Arc::new(DashMap::new()),
            listeners: TaskTracker::new(),
            channel_ids: ChannelIdGenerator::new(),
        }
    }

    async fn bind_with_retry(&self, addr: SocketAddr) -> Result<TcpListener, TcpProxyServerError> {
        let attempts = self.config.bind_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Bound {} on attempt {}/{}", addr, attempt, attempts);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                    warn!(
                        "Port {} is in use (attempt {}/{}), retrying",
                        addr.port(),
                        attempt,
                        attempts
                    );
                    last_error = Some(e);
                    tokio::time::sleep(self.config.bind_retry_delay).await;
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        Err(TcpProxyServerError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Bind the listening socket for a TCP tunnel and start accepting peers
    pub async fn bind(
        &self,
        session_id: &str,
        ip: IpAddr,
        port: u16,
        uplink: Arc<dyn SessionUplink>,
    ) -> Result<SocketAddr, TcpProxyServerError> {
        let listener = self.bind_with_retry(SocketAddr::new(ip, port)).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "TCP listener on {} for session {}",
            local_addr, session_id
        );

        // Port 0 asks the OS for one; key everything by the port actually bound
        let port = local_addr.port();
        let handle = tokio::spawn(accept_loop(
            listener,
            port,
            session_id.to_string(),
            uplink,
            self.peers.clone(),
            self.channel_ids.clone(),
            self.config.clone(),
        ));
        self.listeners.register(port, handle);

        Ok(local_addr)
    }

    /// Stop accepting on `port` and close every peer still connected through it.
    /// Returns the number of peers closed.
    pub async fn unbind(&self, port: u16) -> usize {
        if let Some(handle) = self.listeners.unregister(port) {
            // Wait for the aborted loop so the socket is closed before the port is reused
            let _ = handle.await;
        }

        let before = self.peers.len();
        self.peers.retain(|_, peer| peer.port != port);
        let closed = before.saturating_sub(self.peers.len());

        info!("TCP listener on port {} closed ({} peer(s))", port, closed);
        closed
    }

    /// Route a data frame from the agent to its peer. An empty payload closes the peer.
    ///
    /// Never waits: the session reader calls this inline, so a peer whose queue
    /// is full is disconnected rather than stalling every other channel.
    pub fn deliver(&self, session_id: &str, frame: DataFrame) -> Result<(), TcpProxyServerError> {
        let channel_id = frame.channel_id;

        let tx = match self.peers.get(&channel_id) {
            Some(peer) if peer.session_id == session_id => peer.tx.clone(),
            _ => return Err(TcpProxyServerError::UnknownChannel(channel_id)),
        };

        if frame.is_close() {
            debug!("Agent closed channel {}", channel_id);
            self.peers.remove(&channel_id);
            return Ok(());
        }

        trace!("{} bytes for channel {}", frame.payload.len(), channel_id);
        match tx.try_send(frame.payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel {} queue is full ({} writes), disconnecting peer",
                    channel_id, self.config.peer_queue_capacity
                );
                self.peers.remove(&channel_id);
                Err(TcpProxyServerError::PeerOverloaded(channel_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TcpProxyServerError::ChannelClosed(channel_id))
            }
        }
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.listeners.contains(port)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_count_for_port(&self, port: u16) -> usize {
        self.peers.iter().filter(|p| p.port == port).count()
    }
}

impl Default for ListenerPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    session_id: String,
    uplink: Arc<dyn SessionUplink>,
    peers: PeerMap,
    channel_ids: ChannelIdGenerator,
    config: ListenerPoolConfig,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let channel_id = channel_ids.generate();
                let (tx, rx) = mpsc::channel(config.peer_queue_capacity);

                debug!(
                    "Peer {} connected on port {} (channel {})",
                    peer_addr, port, channel_id
                );

                // Registered before the relay starts so an immediate EOF still finds it
                peers.insert(
                    channel_id,
                    PeerHandle {
                        port,
                        session_id: session_id.clone(),
                        tx,
                    },
                );

                tokio::spawn(relay_peer(
                    stream,
                    channel_id,
                    session_id.clone(),
                    rx,
                    uplink.clone(),
                    peers.clone(),
                    config.read_buffer_size,
                ));
            }
            Err(e) => {
                error!("Failed to accept TCP connection on port {}: {}", port, e);
            }
        }
    }
}

async fn relay_peer(
    stream: TcpStream,
    channel_id: ChannelId,
    session_id: String,
    mut rx: mpsc::Receiver<Bytes>,
    uplink: Arc<dyn SessionUplink>,
    peers: PeerMap,
    read_buffer_size: usize,
) {
    let (mut peer_read, mut peer_write) = stream.into_split();
    let mut buffer = vec![0u8; read_buffer_size];

    loop {
        tokio::select! {
            read = peer_read.read(&mut buffer) => {
                match read {
                    Ok(0) => {
                        debug!("Peer closed channel {}", channel_id);
                        break;
                    }
                    Ok(n) => {
                        let frame = DataFrame::new(channel_id, Bytes::copy_from_slice(&buffer[..n]));
                        if let Err(e) = uplink.send_data(&session_id, frame).await {
                            warn!("Dropping channel {}: {}", channel_id, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Read error on channel {}: {}", channel_id, e);
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(data) => {
                        if let Err(e) = peer_write.write_all(&data).await {
                            debug!("Write error on channel {}: {}", channel_id, e);
                            break;
                        }
                    }
                    None => {
                        // Removed by the agent or by tunnel teardown
                        let _ = peer_write.shutdown().await;
                        return;
                    }
                }
            }
        }
    }

    // Peer side ended first: tell the agent, unless the channel was already torn down
    if peers.remove(&channel_id).is_some() {
        if let Err(e) = uplink.send_data(&session_id, DataFrame::close(channel_id)).await {
            debug!("Could not send close for channel {}: {}", channel_id, e);
        }
    }
    let _ = peer_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// Uplink that forwards frames to a test channel
    struct ChannelUplink {
        tx: mpsc::UnboundedSender<(String, DataFrame)>,
    }

    #[async_trait]
    impl SessionUplink for ChannelUplink {
        async fn send_data(&self, session_id: &str, frame: DataFrame) -> Result<(), UplinkError> {
            self.tx
                .send((session_id.to_string(), frame))
                .map_err(|e| UplinkError(e.to_string()))
        }
    }

    fn uplink() -> (
        Arc<dyn SessionUplink>,
        mpsc::UnboundedReceiver<(String, DataFrame)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelUplink { tx }), rx)
    }

    async fn bind_ephemeral(pool: &ListenerPool, session: &str, uplink: Arc<dyn SessionUplink>) -> SocketAddr {
        pool.bind(session, "127.0.0.1".parse().unwrap(), 0, uplink)
            .await
            .unwrap()
    }

    #[test]
    fn test_channel_id_generator() {
        let gen = ChannelIdGenerator::new();
        assert_eq!(gen.generate(), 1);
        assert_eq!(gen.generate(), 2);
    }

    #[tokio::test]
    async fn test_peer_bytes_reach_uplink_and_back() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"ping").await.unwrap();

        let (session, frame) = timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session, "s-1");
        assert_eq!(&frame.payload[..], b"ping");

        pool.deliver("s-1", DataFrame::new(frame.channel_id, &b"pong"[..]))
            .unwrap();

        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_agent_close_frame_closes_peer() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();
        let (_, frame) = frames.recv().await.unwrap();

        pool.deliver("s-1", DataFrame::close(frame.channel_id))
            .unwrap();
        assert_eq!(pool.peer_count(), 0);

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_peer_close_sends_empty_frame() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"bye").await.unwrap();
        let (_, first) = frames.recv().await.unwrap();
        drop(peer);

        let (_, close) = timeout(Duration::from_secs(5), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(close.channel_id, first.channel_id);
        assert!(close.is_close());
        assert_eq!(pool.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_deliver_checks_ownership() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();
        let (_, frame) = frames.recv().await.unwrap();

        let err = pool
            .deliver("s-2", DataFrame::new(frame.channel_id, &b"y"[..]))
            .unwrap_err();
        assert!(matches!(err, TcpProxyServerError::UnknownChannel(_)));

        let err = pool
            .deliver("s-1", DataFrame::new(9999, &b"y"[..]))
            .unwrap_err();
        assert!(matches!(err, TcpProxyServerError::UnknownChannel(9999)));
    }

    #[tokio::test]
    async fn test_unbind_closes_listener_and_peers() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();
        frames.recv().await.unwrap();

        assert_eq!(pool.unbind(addr.port()).await, 1);
        assert!(!pool.is_bound(addr.port()));

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // Port can be bound again
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_ephemeral_bind_is_keyed_by_actual_port() {
        let pool = ListenerPool::new();
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        assert_ne!(addr.port(), 0);
        assert!(pool.is_bound(addr.port()));
        assert!(!pool.is_bound(0));

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();
        frames.recv().await.unwrap();
        assert_eq!(pool.peer_count_for_port(addr.port()), 1);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped_without_blocking() {
        let pool = ListenerPool::with_config(ListenerPoolConfig {
            peer_queue_capacity: 1,
            ..Default::default()
        });
        let (uplink, mut frames) = uplink();
        let addr = bind_ephemeral(&pool, "s-1", uplink).await;

        // Connects and sends once, then never reads
        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();
        let (_, frame) = frames.recv().await.unwrap();

        let payload = Bytes::from(vec![0u8; 1024 * 1024]);
        let mut overloaded = None;
        for _ in 0..256 {
            match pool.deliver("s-1", DataFrame::new(frame.channel_id, payload.clone())) {
                Ok(()) => tokio::task::yield_now().await,
                Err(e) => {
                    overloaded = Some(e);
                    break;
                }
            }
        }

        assert!(matches!(
            overloaded,
            Some(TcpProxyServerError::PeerOverloaded(id)) if id == frame.channel_id
        ));
        assert_eq!(pool.peer_count(), 0);
        drop(peer);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let pool = ListenerPool::with_config(ListenerPoolConfig {
            bind_attempts: 1,
            ..Default::default()
        });
        let (uplink, _frames) = uplink();

        let err = pool
            .bind("s-1", "127.0.0.1".parse().unwrap(), port, uplink)
            .await
            .unwrap_err();
        assert!(matches!(err, TcpProxyServerError::BindError { port: p, .. } if p == port));
        assert_eq!(pool.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_uplink_failure_drops_channel() {
        struct FailingUplink {
            calls: Mutex<usize>,
        }

        #[async_trait]
        impl SessionUplink for FailingUplink {
            async fn send_data(&self, _: &str, _: DataFrame) -> Result<(), UplinkError> {
                *self.calls.lock().unwrap() += 1;
                Err(UplinkError("session gone".to_string()))
            }
        }

        let pool = ListenerPool::new();
        let addr = bind_ephemeral(
            &pool,
            "s-1",
            Arc::new(FailingUplink {
                calls: Mutex::new(0),
            }),
        )
        .await;

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"x").await.unwrap();

        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }
}
