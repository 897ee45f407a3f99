//! Multiplexer frame format, one frame per binary WebSocket message.
//!
//! Wire format: `[1-byte kind][4-byte stream_id BE][payload]`
//!
//! Frame kinds:
//! - `0x01`: open a stream (empty payload)
//! - `0x02`: data for a stream
//! - `0x03`: close a stream (empty payload)
//! - `0x04`: grant the sender more window (4-byte BE increment)
//!
//! Every stream starts with [`INITIAL_WINDOW`] bytes of send credit in each
//! direction. A sender never has more unacknowledged data in flight than its
//! credit; the receiver returns credit as the application reads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{SessionError, WstunResult};

pub const HEADER_LEN: usize = 5;

/// Largest payload carried by one data frame.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Send credit each stream starts with, per direction.
pub const INITIAL_WINDOW: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Open,
    Data,
    Close,
    WindowUpdate,
}

impl FrameKind {
    fn as_byte(self) -> u8 {
        match self {
            FrameKind::Open => 0x01,
            FrameKind::Data => 0x02,
            FrameKind::Close => 0x03,
            FrameKind::WindowUpdate => 0x04,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameKind::Open),
            0x02 => Some(FrameKind::Data),
            0x03 => Some(FrameKind::Close),
            0x04 => Some(FrameKind::WindowUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Open,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            stream_id,
            payload,
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            kind: FrameKind::Close,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self {
            kind: FrameKind::WindowUpdate,
            stream_id,
            payload: Bytes::copy_from_slice(&increment.to_be_bytes()),
        }
    }

    /// Credit carried by a window update; `None` for other kinds or a
    /// malformed payload.
    pub fn increment(&self) -> Option<u32> {
        if self.kind != FrameKind::WindowUpdate {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.as_byte());
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(data: Bytes) -> WstunResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(SessionError::OpenFailed(format!(
                "mux frame too short: {} bytes",
                data.len()
            ))
            .into());
        }
        let kind = FrameKind::from_byte(data[0]).ok_or_else(|| {
            SessionError::OpenFailed(format!("unknown mux frame kind: {:#04x}", data[0]))
        })?;
        let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        Ok(Self {
            kind,
            stream_id,
            payload: data.slice(HEADER_LEN..),
        })
    }
}
