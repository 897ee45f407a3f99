//! WebSocket transport to the relay server.
//!
//! Dials TCP (optionally IPv4 only), upgrades to WebSocket (over TLS for
//! `wss://`), and starts a client-role multiplexed session on it.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, info};
use wstun_core::{TransportError, WsMux, WstunError, WstunResult};

use crate::session::Dialer;

/// Dials the relay server and builds a [`WsMux`] over the connection.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    host: String,
    port: u16,
    ipv4_only: bool,
}

impl WsDialer {
    /// Parse a `ws://` or `wss://` URL.
    pub fn new(url: &str, ipv4_only: bool) -> WstunResult<Self> {
        let (host, port) = parse_ws_url(url)?;
        Ok(Self {
            url: url.to_string(),
            host,
            port,
            ipv4_only,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve the server host, keeping only IPv4 results when asked to.
    async fn resolve(&self) -> WstunResult<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| TransportError::DialFailed(format!("resolve {}: {e}", self.host)))?
            .filter(|a| !self.ipv4_only || a.is_ipv4())
            .collect();

        if addrs.is_empty() {
            return Err(TransportError::DialFailed(format!(
                "no {}addresses for {}",
                if self.ipv4_only { "IPv4 " } else { "" },
                self.host
            ))
            .into());
        }
        Ok(addrs)
    }

    async fn dial_tcp(&self) -> WstunResult<TcpStream> {
        let mut last_err = None;
        for addr in self.resolve().await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(addr = %addr, "transport TCP connected");
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "transport TCP connect failed");
                    last_err = Some(e);
                }
            }
        }
        let reason = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no address succeeded".into());
        Err(TransportError::DialFailed(format!("{}:{}: {reason}", self.host, self.port)).into())
    }
}

impl Dialer for WsDialer {
    type Session = WsMux;

    async fn establish(&self) -> WstunResult<WsMux> {
        let tcp = self.dial_tcp().await?;
        let (ws, _response) = tokio_tungstenite::client_async_tls(self.url.as_str(), tcp)
            .await
            .map_err(|e| TransportError::UpgradeFailed(e.to_string()))?;
        info!(url = %self.url, "WebSocket connected");
        Ok(WsMux::client(ws))
    }
}

/// Split a WebSocket URL into `(host, port)`, defaulting the port from the
/// scheme.
pub fn parse_ws_url(url: &str) -> WstunResult<(String, u16)> {
    let uri: Uri = url
        .parse()
        .map_err(|e| WstunError::Config(format!("invalid URL {url}: {e}")))?;

    let default_port = match uri.scheme_str() {
        Some("ws") => 80,
        Some("wss") => 443,
        _ => {
            return Err(WstunError::Config(format!(
                "unsupported URL scheme: {url} (expected ws:// or wss://)"
            )))
        }
    };

    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WstunError::Config(format!("URL has no host: {url}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

    Ok((host, uri.port_u16().unwrap_or(default_port)))
}
