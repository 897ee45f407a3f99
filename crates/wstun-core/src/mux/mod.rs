//! Stream multiplexing over a single transport connection.
//!
//! [`Multiplexer`] is the contract the tunnel ends are written against:
//! open and accept independent ordered byte streams, and report whether the
//! session underneath is still alive. [`WsMux`] implements it over one
//! WebSocket connection.

pub mod frame;
pub mod websocket;

pub use frame::{Frame, FrameKind};
pub use websocket::{MuxStream, WsMux};

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::WstunResult;

/// Which end of the session this side is. Determines stream id parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A multiplexed session: many logical duplex streams over one connection.
pub trait Multiplexer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to the peer.
    fn open_stream(&self) -> impl Future<Output = WstunResult<Self::Stream>> + Send;

    /// Wait for the next peer-initiated stream.
    fn accept_stream(&self) -> impl Future<Output = WstunResult<Self::Stream>> + Send;

    /// Whether the session is closed. Once true it never becomes false.
    fn is_closed(&self) -> bool;

    /// Close the session and every stream on it.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
