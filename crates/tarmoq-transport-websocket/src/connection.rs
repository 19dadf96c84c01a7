//! Write half of an agent connection
//!
//! The broker writes through [`WsControlSink`], which queues messages for a
//! writer task that owns the websocket sink. The writer also sends periodic
//! pings so idle agents keep answering with pongs.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tarmoq_control::{ControlSink, TransportError, WireFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, trace};

use crate::stream::{inbound_stream, InboundStream};

/// Broker-facing sink backed by the connection's writer task
pub struct WsControlSink {
    connection_id: String,
    tx: mpsc::Sender<Message>,
}

impl WsControlSink {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

#[async_trait]
impl ControlSink for WsControlSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx
            .send(Message::Close(None))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Split an accepted websocket into the broker's sink and inbound stream
pub fn split_connection<S>(
    ws_stream: WebSocketStream<S>,
    keep_alive_interval: Duration,
    queue: usize,
) -> (Box<dyn ControlSink>, InboundStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
    let (ws_sink, ws_source) = ws_stream.split();
    let (tx, rx) = mpsc::channel(queue.max(1));

    let conn_id = connection_id.clone();
    tokio::spawn(async move {
        writer_task(ws_sink, rx, keep_alive_interval, conn_id).await;
    });

    let sink = WsControlSink { connection_id, tx };
    (Box::new(sink), inbound_stream(ws_source))
}

async fn writer_task<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    keep_alive_interval: Duration,
    conn_id: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval(keep_alive_interval);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(Message::Close(frame)) => {
                    debug!("[{}] Closing websocket", conn_id);
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        error!("[{}] WebSocket send error: {}", conn_id, e);
                        break;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                trace!("[{}] Sending ping", conn_id);
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("[{}] Ping failed: {}", conn_id, e);
                    break;
                }
            }
        }
    }

    debug!("[{}] WebSocket writer task ended", conn_id);
    let _ = sink.close().await;
}
