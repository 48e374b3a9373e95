//! Relay configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file,
//! then `MIRROR__SECTION__KEY` environment variables.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::hub::HubConfig;

pub const APP_NAME: &str = "mirror";

const ENV_PREFIX: &str = "MIRROR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub public: PublicUrlConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Directory served under `/public`. Not mounted when unset or missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_dir: Option<String>,
    /// Largest WebSocket message accepted from a host, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7654,
            public_dir: None,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind, self.port))
    }

    pub fn public_dir_path(&self) -> Result<Option<PathBuf>> {
        self.public_dir.as_deref().map(expand_str_path).transpose()
    }
}

/// Schemes used when building links handed out to editors and viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicUrlConfig {
    /// Scheme of connect/join page links.
    pub http_scheme: String,
    /// Scheme of the listener stream address embedded in the join page.
    pub ws_scheme: String,
}

impl Default for PublicUrlConfig {
    fn default() -> Self {
        Self {
            http_scheme: "http".to_string(),
            ws_scheme: "wss".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `path` (optional on disk) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let built = Config::builder()
            .set_default("server.bind", "0.0.0.0")?
            .set_default("server.port", 7654_i64)?
            .set_default("logging.level", "info")?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hub.listener_buffer == 0 {
            bail!("hub.listener_buffer must be at least 1");
        }
        if self.hub.registration_buffer == 0 {
            bail!("hub.registration_buffer must be at least 1");
        }
        if self.public.http_scheme.is_empty() || self.public.ws_scheme.is_empty() {
            bail!("public.http_scheme and public.ws_scheme cannot be empty");
        }
        if self.server.max_message_size == 0 {
            bail!("server.max_message_size must be greater than 0");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing config to TOML")
    }
}

/// Resolve the config file path: an explicit file, `config.toml` inside an
/// explicit directory, or the per-user default.
pub fn resolve_config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => {
            let expanded = expand_path(path)?;
            if expanded.is_dir() {
                Ok(expanded.join("config.toml"))
            } else {
                Ok(expanded)
            }
        }
        None => Ok(default_config_dir()?.join("config.toml")),
    }
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine config directory"))
}

/// Write a commented default config to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&AppConfig::default().to_toml()?);

    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(raw) => expand_str_path(raw),
        None => Ok(path),
    }
}

fn expand_str_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("expanding path {raw}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
