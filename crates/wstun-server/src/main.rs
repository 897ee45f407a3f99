//! wstun-server: WebSocket tunnel relay.
//!
//! Accepts WebSocket (optionally TLS) connections on `/<password>`, runs a
//! multiplexed session on each, and dials the destination every stream asks
//! for. With `--fp` the same listener also serves a directory under
//! `/files/`.

mod config;
mod server;
mod transport;

use clap::Parser;
use config::ServerConfig;
use server::TunnelServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// wstun-server: WebSocket tunnel relay
#[derive(Parser, Debug)]
#[command(name = "wstun-server", version, about = "WebSocket tunnel relay")]
struct Cli {
    /// Path-segment password clients must upgrade on
    #[arg(long = "pwd")]
    password: Option<String>,

    /// Listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Directory to serve under /files/
    #[arg(long = "fp")]
    files: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wstun/server.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = config::expand_tilde(Path::new(&cli.config));

    // Resolve cert/key paths
    let (cert_path, key_path) = if cli.generate_cert {
        let dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        match generate_self_signed_cert(&dir) {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (
                    Some(c.to_string_lossy().into_owned()),
                    Some(k.to_string_lossy().into_owned()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    // Load server config (file + CLI overrides)
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.password.as_deref(),
        cert_path.as_deref(),
        key_path.as_deref(),
        cli.files.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %server_config.listen,
        tls = server_config.tls.is_some(),
        "starting wstun-server"
    );

    // Load TLS config
    let tls_config = match &server_config.tls {
        Some(paths) => match transport::websocket::load_tls_config(&paths.cert, &paths.key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to load TLS config");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let tunnel_server = match TunnelServer::bind(&server_config, tls_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    match tunnel_server.local_addr() {
        Ok(addr) => info!(addr = %addr, "accepting tunnels"),
        Err(e) => warn!(error = %e, "bound address unavailable"),
    }

    // Run until shutdown signal
    tokio::select! {
        result = tunnel_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("wstun-server stopped");
}

/// Generate a self-signed certificate for development use, writing
/// `cert.pem` and `key.pem` into `dir`.
fn generate_self_signed_cert(dir: &Path) -> anyhow::Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "wstun-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
