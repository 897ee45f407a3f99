//! Tunnel listener: one HTTP/1.1 endpoint serving two routes.
//!
//! Accepted TCP connections are optionally wrapped in TLS and then served by
//! hyper. `/<password>` upgrades to WebSocket and becomes a server-role
//! [`WsMux`]; `/files/<path>` serves the configured directory when one is
//! set. Every other request is answered 404.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION,
    UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
use tokio_tungstenite::WebSocketStream;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info};
use wstun_core::{TransportError, WsMux, WstunResult};

type Body = UnsyncBoxBody<Bytes, io::Error>;

/// Prefix under which the file directory is served.
const FILES_PREFIX: &str = "/files/";

/// Where each request path goes.
struct Routes {
    upgrade_path: String,
    files: Option<ServeDir>,
}

/// Bound listener plus what every accepted connection needs to be served.
pub struct WsListener {
    tcp: TcpListener,
    acceptor: Option<TlsAcceptor>,
    routes: Arc<Routes>,
}

impl WsListener {
    /// Bind `addr`. With `tls` set every connection must complete a TLS
    /// handshake first. With `files` set, `/files/<path>` serves that
    /// directory.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
        upgrade_path: String,
        files: Option<PathBuf>,
    ) -> WstunResult<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local = tcp.local_addr()?;
        info!(
            addr = %local,
            tls = tls.is_some(),
            files = files.as_ref().map(|dir| dir.display().to_string()),
            "WebSocket listener started"
        );
        Ok(Self {
            tcp,
            acceptor: tls.map(TlsAcceptor::from),
            routes: Arc::new(Routes {
                upgrade_path,
                files: files.map(ServeDir::new),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub async fn accept(&self) -> io::Result<(Pending, SocketAddr)> {
        let (stream, addr) = self.tcp.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((
            Pending {
                stream,
                acceptor: self.acceptor.clone(),
                routes: self.routes.clone(),
            },
            addr,
        ))
    }
}

/// An accepted TCP connection that has not been served yet.
pub struct Pending {
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    routes: Arc<Routes>,
}

impl Pending {
    /// Run TLS (if configured) and serve HTTP until the connection either
    /// upgrades or closes. Returns the session for an upgraded connection
    /// and `None` for one that only fetched files or was refused.
    pub async fn serve(self) -> WstunResult<Option<WsMux>> {
        match self.acceptor {
            Some(acceptor) => {
                let tls = acceptor
                    .accept(self.stream)
                    .await
                    .map_err(|e| TransportError::UpgradeFailed(format!("TLS handshake: {e}")))?;
                serve_http(tls, self.routes).await
            }
            None => serve_http(self.stream, self.routes).await,
        }
    }
}

async fn serve_http<I>(io: I, routes: Arc<Routes>) -> WstunResult<Option<WsMux>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upgrade: Arc<Mutex<Option<OnUpgrade>>> = Arc::new(Mutex::new(None));

    let slot = upgrade.clone();
    let service = service_fn(move |req| route(req, routes.clone(), slot.clone()));
    http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(|e| TransportError::UpgradeFailed(e.to_string()))?;

    let pending = upgrade.lock().unwrap_or_else(|e| e.into_inner()).take();
    let Some(on_upgrade) = pending else {
        debug!("connection closed without upgrade");
        return Ok(None);
    };
    let upgraded = on_upgrade
        .await
        .map_err(|e| TransportError::UpgradeFailed(e.to_string()))?;
    let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), WsRole::Server, None).await;
    Ok(Some(WsMux::server(ws)))
}

async fn route(
    req: Request<Incoming>,
    routes: Arc<Routes>,
    upgrade: Arc<Mutex<Option<OnUpgrade>>>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path();
    if path == routes.upgrade_path {
        return Ok(accept_upgrade(req, &upgrade));
    }
    if let (Some(rest), Some(files)) = (path.strip_prefix(FILES_PREFIX), &routes.files) {
        let rest = rest.to_string();
        return Ok(serve_file(req, rest, files.clone()).await);
    }
    debug!(path = %path, "unknown path, answering 404");
    Ok(status(StatusCode::NOT_FOUND))
}

/// Answer a WebSocket upgrade request with 101 and park the upgrade for
/// [`serve_http`] to pick up once hyper releases the connection.
fn accept_upgrade(
    mut req: Request<Incoming>,
    upgrade: &Mutex<Option<OnUpgrade>>,
) -> Response<Body> {
    let headers = req.headers();
    let wants_websocket = req.method() == Method::GET
        && header_has_token(headers.get(UPGRADE), "websocket")
        && header_has_token(headers.get(CONNECTION), "upgrade")
        && headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) == Some(&b"13"[..]);
    let key = headers.get(SEC_WEBSOCKET_KEY).map(HeaderValue::as_bytes);
    let accept = match (wants_websocket, key) {
        (true, Some(key)) => derive_accept_key(key),
        _ => {
            debug!("request on the upgrade path is not a WebSocket upgrade");
            return status(StatusCode::BAD_REQUEST);
        }
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return status(StatusCode::INTERNAL_SERVER_ERROR);
    };

    *upgrade.lock().unwrap_or_else(|e| e.into_inner()) = Some(hyper::upgrade::on(&mut req));

    let mut resp = status(StatusCode::SWITCHING_PROTOCOLS);
    let headers = resp.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    resp
}

/// Serve `rest` from the file directory. Traversal outside the directory is
/// refused by [`ServeDir`].
async fn serve_file(
    mut req: Request<Incoming>,
    rest: String,
    files: ServeDir,
) -> Response<Body> {
    let target = match req.uri().query() {
        Some(query) => format!("/{rest}?{query}"),
        None => format!("/{rest}"),
    };
    let Ok(uri) = target.parse::<Uri>() else {
        return status(StatusCode::BAD_REQUEST);
    };
    *req.uri_mut() = uri;

    match files.oneshot(req).await {
        Ok(resp) => {
            debug!(path = %rest, status = %resp.status(), "file request");
            resp.map(|body| body.boxed_unsync())
        }
        Err(never) => match never {},
    }
}

fn header_has_token(value: Option<&HeaderValue>, token: &str) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
}

fn status(code: StatusCode) -> Response<Body> {
    let mut resp = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *resp.status_mut() = code;
    resp
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
pub fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> anyhow::Result<rustls::ServerConfig> {
    use anyhow::Context;

    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("cannot read cert {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("cannot read key {}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in {}", cert_path.display());
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}
