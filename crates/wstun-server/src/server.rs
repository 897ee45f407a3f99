//! Tunnel server: accepts transport connections and serves the streams of
//! each one's multiplexed session.
//!
//! Every accepted stream starts with an encoded SOCKS5 address naming the
//! destination. The server dials it and relays until either side closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};
use wstun_core::{
    back_off_after_accept_error, relay, Address, Multiplexer, RelayError, WstunResult,
};

use crate::config::ServerConfig;
use crate::transport::websocket::WsListener;

/// Number of streams being served across all sessions.
#[derive(Debug, Clone, Default)]
pub struct ActiveStreams(Arc<AtomicUsize>);

impl ActiveStreams {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> StreamGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        StreamGuard(self.0.clone())
    }
}

/// Counts one stream task until dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The wstun server instance.
pub struct TunnelServer {
    listener: WsListener,
    active: ActiveStreams,
}

impl TunnelServer {
    /// Bind the listener described by `config`.
    pub async fn bind(
        config: &ServerConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> WstunResult<Self> {
        let listener = WsListener::bind(
            config.listen,
            tls,
            config.upgrade_path(),
            config.files.clone(),
        )
        .await?;
        Ok(Self {
            listener,
            active: ActiveStreams::default(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Gauge of the stream tasks this server is running.
    pub fn active_streams(&self) -> ActiveStreams {
        self.active.clone()
    }

    /// Accept transport connections forever; each gets its own session.
    pub async fn run(self) -> WstunResult<()> {
        loop {
            let (pending, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    back_off_after_accept_error(&e).await;
                    continue;
                }
            };

            let span = info_span!("conn", remote = %remote);
            let active = self.active.clone();
            tokio::spawn(
                async move {
                    let mux = match pending.serve().await {
                        Ok(Some(mux)) => mux,
                        Ok(None) => return,
                        Err(e) => {
                            debug!(error = %e, "transport upgrade failed");
                            return;
                        }
                    };
                    info!("session started");
                    serve_session(mux, active).await;
                    info!("session ended");
                }
                .instrument(span),
            );
        }
    }
}

/// Accept streams on `mux` until the session ends, relaying each on its own
/// task counted in `active`.
pub async fn serve_session<M: Multiplexer>(mux: M, active: ActiveStreams) {
    loop {
        let stream = match mux.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "accept stream failed, ending session");
                break;
            }
        };
        let guard = active.enter();
        tokio::spawn(
            async move {
                handle_stream(stream).await;
                drop(guard);
            }
            .in_current_span(),
        );
    }
    mux.close().await;
}

/// Decode the destination header, dial it and relay.
async fn handle_stream<S>(mut stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let dest = match Address::read_from(&mut stream).await {
        Ok(dest) => dest,
        Err(e) => {
            debug!(error = %e, "bad destination header");
            return;
        }
    };

    let target = match TcpStream::connect(dest.to_string()).await {
        Ok(target) => target,
        Err(source) => {
            let err = RelayError::DestinationUnreachable {
                addr: dest.to_string(),
                source,
            };
            warn!(error = %err, "dial failed");
            return;
        }
    };
    let _ = target.set_nodelay(true);

    debug!(dest = %dest, "relaying");
    let stats = relay(stream, target).await;
    debug!(
        dest = %dest,
        to_dest = stats.forward,
        from_dest = stats.reverse,
        "relay finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use wstun_client::{SessionManager, TunnelClient, WsDialer};
    use wstun_core::HandshakeConfig;

    const BOUND: Duration = Duration::from_secs(5);

    fn test_config() -> ServerConfig {
        ServerConfig::load(None, Some("127.0.0.1:0"), Some("secret"), None, None, None).unwrap()
    }

    /// Echo server for exactly one connection; fires `done` once the
    /// connection has been closed by the peer.
    async fn echo_once() -> (SocketAddr, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = done_tx.send(());
        });
        (addr, done_rx)
    }

    /// Server + client wired together over loopback; returns the client's
    /// SOCKS5 address and the server's stream gauge.
    async fn start_tunnel() -> (SocketAddr, ActiveStreams) {
        let server = TunnelServer::bind(&test_config(), None).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let active = server.active_streams();
        tokio::spawn(server.run());

        let dialer = WsDialer::new(&format!("ws://{server_addr}/secret"), false).unwrap();
        let sessions = Arc::new(SessionManager::connect(dialer).await.unwrap());
        let client = TunnelClient::new(sessions, HandshakeConfig::default());

        let socks = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = socks.local_addr().unwrap();
        tokio::spawn(client.serve(socks));
        (socks_addr, active)
    }

    async fn socks_connect(socks: SocketAddr, dest: SocketAddr) -> TcpStream {
        let mut conn = TcpStream::connect(socks).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        conn.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00];
        request.extend(Address::encode(&dest.ip().to_string(), dest.port()).unwrap().to_bytes());
        conn.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, wstun_core::handshake::CONNECT_REPLY);
        conn
    }

    #[tokio::test]
    async fn end_to_end_echo_and_teardown() {
        let (echo_addr, echo_done) = echo_once().await;
        let (socks, active) = start_tunnel().await;

        let mut conn = socks_connect(socks, echo_addr).await;
        conn.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        timeout(BOUND, conn.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"hello");
        assert_eq!(active.count(), 1);

        drop(conn);
        timeout(BOUND, echo_done)
            .await
            .expect("destination connection not closed in time")
            .unwrap();
        timeout(BOUND, async {
            while active.count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server stream task still running");
    }

    #[tokio::test]
    async fn concurrent_connections_share_one_session() {
        let (socks, _) = start_tunnel().await;

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let (echo_addr, _done) = echo_once().await;
            handles.push(tokio::spawn(async move {
                let mut conn = socks_connect(socks, echo_addr).await;
                let payload = vec![i; 4096];
                conn.write_all(&payload).await.unwrap();
                let mut back = vec![0u8; payload.len()];
                timeout(BOUND, conn.read_exact(&mut back))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(back, payload);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unreachable_destination_closes_local_connection() {
        let dead = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (socks, active) = start_tunnel().await;

        let mut conn = socks_connect(socks, dead).await;
        let mut rest = Vec::new();
        timeout(BOUND, conn.read_to_end(&mut rest))
            .await
            .expect("local connection not closed in time")
            .unwrap();
        assert!(rest.is_empty());
        timeout(BOUND, async {
            while active.count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server stream task still running");
    }

    #[tokio::test]
    async fn wrong_password_is_refused() {
        let server = TunnelServer::bind(&test_config(), None).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let dialer = WsDialer::new(&format!("ws://{server_addr}/guess"), false).unwrap();
        let err = SessionManager::connect(dialer).await.err().unwrap();
        assert!(matches!(
            err,
            wstun_core::WstunError::Transport(wstun_core::TransportError::UpgradeFailed(_))
        ));
    }
}
