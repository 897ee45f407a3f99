//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use wstun_core::{WstunError, WstunResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    /// Directory served under `/files/`.
    #[serde(default)]
    pub files: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            password: default_password(),
            cert: None,
            key: None,
            files: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:443".to_string()
}
fn default_password() -> String {
    "password".to_string()
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub password: String,
    /// Certificate and key; `None` serves plain `ws://`.
    pub tls: Option<TlsPaths>,
    /// Directory served under `/files/`; `None` disables file serving.
    pub files: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_listen: Option<&str>,
        cli_password: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_files: Option<&str>,
    ) -> WstunResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| WstunError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };
        let section = file_config.server;

        let listen_str = cli_listen.map(str::to_string).unwrap_or(section.listen);
        let listen = listen_str
            .parse()
            .map_err(|e| WstunError::Config(format!("invalid listen address {listen_str}: {e}")))?;

        let password = cli_password
            .map(str::to_string)
            .unwrap_or(section.password);
        if password.is_empty() || password.contains('/') {
            return Err(WstunError::Config(
                "password must be a single non-empty path segment".into(),
            ));
        }

        let cert = cli_cert.map(str::to_string).or(section.cert);
        let key = cli_key.map(str::to_string).or(section.key);
        let tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: expand_tilde_str(&cert),
                key: expand_tilde_str(&key),
            }),
            (None, None) => None,
            _ => {
                return Err(WstunError::Config(
                    "cert and key must be given together".into(),
                ))
            }
        };

        let files = cli_files
            .map(str::to_string)
            .or(section.files)
            .map(|dir| expand_tilde_str(&dir));
        if let Some(dir) = &files {
            if !dir.is_dir() {
                return Err(WstunError::Config(format!(
                    "file directory {} does not exist",
                    dir.display()
                )));
            }
        }

        Ok(Self {
            listen,
            password,
            tls,
            files,
        })
    }

    /// Request path a client must upgrade on.
    pub fn upgrade_path(&self) -> String {
        format!("/{}", self.password)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
