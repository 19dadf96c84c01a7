//! Read half of an agent connection
//!
//! Turns tungstenite messages into broker [`Inbound`] events. Ping and pong
//! frames count as keepalives; a close frame ends the stream.

use bytes::Bytes;
use futures_util::stream::{SplitStream, Stream, StreamExt};
use std::pin::Pin;
use tarmoq_control::{Inbound, TransportError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

/// What one websocket message means to the broker
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    Event(Inbound),
    Skip,
    End,
}

pub(crate) fn decode_message(message: Message) -> Decoded {
    match message {
        Message::Text(text) => Decoded::Event(Inbound::Text(text)),
        Message::Binary(data) => Decoded::Event(Inbound::Binary(Bytes::from(data))),
        Message::Ping(_) | Message::Pong(_) => Decoded::Event(Inbound::Keepalive),
        Message::Close(frame) => {
            trace!("Close frame received: {:?}", frame);
            Decoded::End
        }
        Message::Frame(_) => Decoded::Skip,
    }
}

fn map_error(e: WsError) -> TransportError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(other.to_string()),
    }
}

/// Adapt the read half of a websocket into the broker's inbound stream
pub fn inbound_stream<S>(source: SplitStream<WebSocketStream<S>>) -> InboundStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let events = source
        .map(|result| result.map(decode_message))
        .take_while(|result| futures_util::future::ready(!matches!(result, Ok(Decoded::End))))
        .filter_map(|result| {
            futures_util::future::ready(match result {
                Ok(Decoded::Event(event)) => Some(Ok(event)),
                Ok(Decoded::Skip) | Ok(Decoded::End) => None,
                Err(e) => Some(Err(map_error(e))),
            })
        });
    Box::pin(events)
}
