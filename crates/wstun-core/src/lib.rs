//! wstun-core: Shared protocol library for the wstun tunnel.
//!
//! Provides the SOCKS5 address codec and server-side handshake, the
//! bidirectional relay used on both tunnel ends, and the stream multiplexer
//! that carries many proxied connections over one WebSocket.

pub mod accept;
pub mod address;
pub mod error;
pub mod handshake;
pub mod mux;
pub mod relay;

// Re-export commonly used items at crate root.
pub use accept::back_off_after_accept_error;
pub use address::Address;
pub use error::{ProtocolError, RelayError, SessionError, TransportError, WstunError, WstunResult};
pub use handshake::{handshake, Command, HandshakeConfig, HandshakeResult, HandshakeState};
pub use mux::{MuxStream, Multiplexer, Role, WsMux};
pub use relay::{relay, RelayStats};
