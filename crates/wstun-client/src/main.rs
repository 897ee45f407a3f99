//! wstun-client: SOCKS5 proxy on localhost, tunnelled over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use wstun_client::{ClientConfig, SessionManager, TunnelClient, WsDialer};

/// wstun-client: SOCKS5 over multiplexed WebSocket
#[derive(Parser, Debug)]
#[command(name = "wstun-client", version, about = "SOCKS5 proxy tunnelled over WebSocket")]
struct Cli {
    /// Server URL, e.g. wss://example.com/password
    url: Option<String>,

    /// Local SOCKS5 listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Only dial the server over IPv4
    #[arg(long)]
    ipv4_only: bool,

    /// Config file path
    #[arg(long, default_value = "~/.wstun/client.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "wstun-client failed");
        std::process::exit(1);
    }
    info!("wstun-client stopped");
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = PathBuf::from(&cli.config);
    let config = ClientConfig::load(
        Some(&config_path),
        cli.url.as_deref(),
        cli.listen.as_deref(),
        cli.ipv4_only,
    )
    .context("failed to load config")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.url,
        listen = %config.listen,
        "starting wstun-client"
    );

    let dialer = WsDialer::new(&config.url, config.ipv4_only).context("invalid server URL")?;
    let sessions = SessionManager::connect(dialer)
        .await
        .context("failed to establish the initial session")?;
    let sessions = Arc::new(sessions);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let client = TunnelClient::new(sessions.clone(), config.handshake());

    tokio::select! {
        result = client.serve(listener) => {
            result.context("local listener failed")?;
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    sessions.close().await;
    Ok(())
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
