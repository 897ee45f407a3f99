//! wstun-client: local SOCKS5 listener that tunnels every accepted
//! connection as one stream of a shared multiplexed WebSocket session.

pub mod config;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;
pub use session::{Dialer, RetryPolicy, SessionManager};
pub use transport::WsDialer;
pub use tunnel::TunnelClient;
