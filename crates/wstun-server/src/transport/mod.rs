//! Transport layer: TCP listener, optional TLS, and the WebSocket upgrade.

pub mod websocket;
