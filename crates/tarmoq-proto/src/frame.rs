//! Binary data-plane frames
//!
//! TCP tunnel bytes share the session channel with control text. Every binary
//! message is `[channel_id: u32 BE][payload]`. An empty payload signals that the
//! peer on that channel closed.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::MAX_FRAME_SIZE;

/// Identifier of one public TCP connection multiplexed over a session
pub type ChannelId = u32;

const HEADER_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("Incomplete frame: {0} bytes")]
    Incomplete(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

impl DataFrame {
    pub fn new(channel_id: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel_id,
            payload: payload.into(),
        }
    }

    /// Close marker for a channel
    pub fn close(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            payload: Bytes::new(),
        }
    }

    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let total = HEADER_LEN + self.payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(total));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(self.channel_id);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Incomplete(data.len()));
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(data.len()));
        }

        let channel_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        Ok(Self {
            channel_id,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }
}
