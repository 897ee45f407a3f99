//! Local SOCKS5 front end.
//!
//! Each accepted local connection gets its own task: SOCKS5 handshake, a
//! stream on the shared session, the encoded destination written as the
//! stream's first bytes, then a relay until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use wstun_core::{
    back_off_after_accept_error, handshake, relay, Command, HandshakeConfig, WstunResult,
};

use crate::session::{Dialer, SessionManager};

/// Accepts local SOCKS5 connections and tunnels them over one session.
pub struct TunnelClient<D: Dialer> {
    sessions: Arc<SessionManager<D>>,
    handshake: Arc<HandshakeConfig>,
}

impl<D: Dialer> Clone for TunnelClient<D> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            handshake: self.handshake.clone(),
        }
    }
}

impl<D: Dialer> TunnelClient<D> {
    pub fn new(sessions: Arc<SessionManager<D>>, handshake: HandshakeConfig) -> Self {
        Self {
            sessions,
            handshake: Arc::new(handshake),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<D>> {
        &self.sessions
    }

    /// Accept local connections forever, one task per connection.
    pub async fn serve(self, listener: TcpListener) -> WstunResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "SOCKS5 listener ready");
        }

        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let client = self.clone();
                    tokio::spawn(async move {
                        client.handle_local(conn, peer).await;
                    });
                }
                Err(e) => back_off_after_accept_error(&e).await,
            }
        }
    }

    /// Handle one local application connection to completion.
    pub async fn handle_local(&self, mut conn: TcpStream, peer: SocketAddr) {
        let request = match handshake(&mut conn, &self.handshake).await {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %peer, error = %e, "SOCKS5 handshake rejected");
                return;
            }
        };

        if request.command != Command::Connect {
            debug!(
                peer = %peer,
                command = ?request.command,
                "command acknowledged but not serviced, closing"
            );
            return;
        }

        let mut stream = match self.sessions.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, dest = %request.address, error = %e, "open stream failed");
                return;
            }
        };

        if let Err(e) = stream.write_all(&request.address.to_bytes()).await {
            warn!(dest = %request.address, error = %e, "write destination header failed");
            return;
        }

        debug!(peer = %peer, dest = %request.address, "relaying");
        let stats = relay(conn, stream).await;
        debug!(
            peer = %peer,
            dest = %request.address,
            sent = stats.forward,
            received = stats.reverse,
            "relay finished"
        );
    }
}
