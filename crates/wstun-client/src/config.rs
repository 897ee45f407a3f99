//! Client configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use wstun_core::{Address, HandshakeConfig, WstunError, WstunResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub client: ClientSection,
}

/// `[client]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub ipv4_only: bool,
    #[serde(default = "default_udp_relay")]
    pub udp_relay: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: default_url(),
            listen: default_listen(),
            ipv4_only: false,
            udp_relay: default_udp_relay(),
        }
    }
}

fn default_url() -> String {
    "wss://127.0.0.1/password".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:1080".to_string()
}
fn default_udp_relay() -> String {
    "127.0.0.1:1080".to_string()
}

/// Resolved client configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub listen: SocketAddr,
    pub ipv4_only: bool,
    pub udp_relay: Address,
}

impl ClientConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_url: Option<&str>,
        cli_listen: Option<&str>,
        cli_ipv4_only: bool,
    ) -> WstunResult<Self> {
        let file_config = match config_path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let section = file_config.client;

        let url = cli_url.map(str::to_string).unwrap_or(section.url);
        let listen_str = cli_listen.map(str::to_string).unwrap_or(section.listen);
        let listen = listen_str
            .parse()
            .map_err(|e| WstunError::Config(format!("invalid listen address {listen_str}: {e}")))?;

        Ok(Self {
            url,
            listen,
            ipv4_only: cli_ipv4_only || section.ipv4_only,
            udp_relay: parse_relay_addr(&section.udp_relay)?,
        })
    }

    pub fn handshake(&self) -> HandshakeConfig {
        HandshakeConfig {
            udp_relay: self.udp_relay.clone(),
        }
    }
}

fn read_config_file(path: &Path) -> WstunResult<ConfigFile> {
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "config file not found, using defaults");
        return Ok(ConfigFile::default());
    }

    info!(path = %expanded.display(), "loading config file");
    let content = std::fs::read_to_string(&expanded)?;
    toml::from_str::<ConfigFile>(&content)
        .map_err(|e| WstunError::Config(format!("config parse error: {e}")))
}

/// Parse `host:port` (IPv6 hosts bracketed) into a SOCKS5 address.
fn parse_relay_addr(s: &str) -> WstunResult<Address> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| WstunError::Config(format!("udp_relay must be host:port, got {s}")))?;
    let port: u16 = port
        .parse()
        .map_err(|e| WstunError::Config(format!("invalid udp_relay port in {s}: {e}")))?;
    Address::encode(host, port)
        .map_err(|e| WstunError::Config(format!("invalid udp_relay host in {s}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = ClientConfig::load(None, None, None, false).unwrap();
        assert_eq!(config.url, "wss://127.0.0.1/password");
        assert_eq!(config.listen, "127.0.0.1:1080".parse().unwrap());
        assert!(!config.ipv4_only);
        assert_eq!(config.udp_relay.to_string(), "127.0.0.1:1080");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = ClientConfig::load(Some(&path), None, None, false).unwrap();
        assert_eq!(config.url, "wss://127.0.0.1/password");
    }

    #[test]
    fn file_values_and_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
url = "wss://relay.example.com/secret"
listen = "127.0.0.1:7070"
ipv4_only = true
udp_relay = "[::1]:5353"
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path()), None, None, false).unwrap();
        assert_eq!(config.url, "wss://relay.example.com/secret");
        assert_eq!(config.listen.port(), 7070);
        assert!(config.ipv4_only);
        assert_eq!(config.udp_relay.to_string(), "[::1]:5353");

        let config = ClientConfig::load(
            Some(file.path()),
            Some("ws://10.0.0.1:8080/other"),
            Some("0.0.0.0:1081"),
            false,
        )
        .unwrap();
        assert_eq!(config.url, "ws://10.0.0.1:8080/other");
        assert_eq!(config.listen.port(), 1081);
    }

    #[test]
    fn bad_listen_address_is_a_config_error() {
        let err = ClientConfig::load(None, None, Some("not-an-addr"), false).unwrap_err();
        assert!(matches!(err, WstunError::Config(_)));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client\nurl = ").unwrap();
        let err = ClientConfig::load(Some(file.path()), None, None, false).unwrap_err();
        assert!(matches!(err, WstunError::Config(_)));
    }
}
