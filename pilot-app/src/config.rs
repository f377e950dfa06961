//! opencode-pilot configuration loader.
//!
//! Sources, lowest precedence first: built-in defaults, the optional TOML
//! file at `~/.opencode-pilot/config.toml`, then environment variables.

use anyhow::{Result, anyhow};
use pilot_auth::DEFAULT_NONCE_TTL;
use pilot_ipc::DEFAULT_SOCKET_PATH;
use pilot_notify::{DEFAULT_NTFY_SERVER, ReadinessConfig, SourceConfig, resolve_source};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CALLBACK_PORT: u16 = 4097;
pub const DEFAULT_CALLBACK_HOST: &str = "localhost";
/// Upper bound for nonce and token lifetimes (30 days).
pub const MAX_CREDENTIAL_TTL_SECONDS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PilotConfig {
    pub ntfy: NtfyConfig,
    pub callback: CallbackConfig,
    pub broker: BrokerConfig,
    pub tokens: TokensConfig,
    pub runtime: RuntimeConfig,
    pub readiness: ReadinessConfig,
    /// `[[sources]]` entries; each may use a `preset` or the `github` shorthand.
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NtfyConfig {
    pub server: String,
    pub topic: Option<String>,
    pub token: Option<String>,
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_NTFY_SERVER.to_string(),
            topic: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Externally reachable hostname placed in notification links.
    pub host: Option<String>,
    pub port: u16,
    /// HMAC key for signed tokens. A random per-process key is used when unset.
    pub secret: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_CALLBACK_PORT,
            secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    pub nonce_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            nonce_ttl_seconds: DEFAULT_NONCE_TTL.as_secs(),
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    /// Reject a token once it has been accepted.
    pub single_use: bool,
    /// Defaults to `broker.nonce_ttl_seconds`.
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            http_timeout_seconds: 10,
            http_max_in_flight: 64,
        }
    }
}

impl PilotConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// A missing file at the default path is not an error; an explicitly
    /// requested path must exist.
    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(config_path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("NTFY_TOPIC") {
            self.ntfy.topic = Some(v.trim().to_string());
        }
        if let Some(v) = var("NTFY_SERVER") {
            self.ntfy.server = v.trim().to_string();
        }
        if let Some(v) = var("NTFY_TOKEN") {
            self.ntfy.token = Some(v);
        }
        if let Some(v) = var("NTFY_CALLBACK_HOST") {
            self.callback.host = Some(v.trim().to_string());
        }
        if let Some(v) = var("NTFY_CALLBACK_PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => self.callback.port = port,
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid NTFY_CALLBACK_PORT")
                }
            }
        }
        if let Some(v) = var("NTFY_CALLBACK_SECRET") {
            self.callback.secret = Some(v);
        }
        if let Some(v) = var("PILOT_SOCKET_PATH") {
            self.broker.socket_path = PathBuf::from(v.trim());
        }
        if let Some(v) = var("PILOT_NONCE_TTL_SECONDS") {
            match v.trim().parse::<u64>() {
                Ok(ttl) => self.broker.nonce_ttl_seconds = ttl,
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "ignoring invalid PILOT_NONCE_TTL_SECONDS")
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.callback.port == 0 {
            return Err(anyhow!("callback.port must be > 0"));
        }
        if self.broker.nonce_ttl_seconds == 0 {
            return Err(anyhow!("broker.nonce_ttl_seconds must be > 0"));
        }
        if self.broker.sweep_interval_seconds == 0 {
            return Err(anyhow!("broker.sweep_interval_seconds must be > 0"));
        }
        if self.broker.nonce_ttl_seconds > MAX_CREDENTIAL_TTL_SECONDS {
            return Err(anyhow!(
                "broker.nonce_ttl_seconds must be <= {MAX_CREDENTIAL_TTL_SECONDS}"
            ));
        }
        if self.tokens.ttl_seconds == Some(0) {
            return Err(anyhow!("tokens.ttl_seconds must be > 0"));
        }
        if self
            .tokens
            .ttl_seconds
            .is_some_and(|ttl| ttl > MAX_CREDENTIAL_TTL_SECONDS)
        {
            return Err(anyhow!(
                "tokens.ttl_seconds must be <= {MAX_CREDENTIAL_TTL_SECONDS}"
            ));
        }
        if self.broker.socket_path.as_os_str().is_empty() {
            return Err(anyhow!("broker.socket_path is required"));
        }
        if self.runtime.http_timeout_seconds == 0 {
            return Err(anyhow!("runtime.http_timeout_seconds must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        if self.ntfy.server.trim().is_empty() {
            return Err(anyhow!("ntfy.server is required"));
        }
        if self
            .callback
            .secret
            .as_deref()
            .is_some_and(|secret| secret.trim().is_empty())
        {
            return Err(anyhow!("callback.secret must not be blank when set"));
        }
        self.resolved_sources()?;
        Ok(())
    }

    /// Sources with presets and shorthands expanded.
    pub fn resolved_sources(&self) -> Result<Vec<SourceConfig>> {
        self.sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                resolve_source(source).map_err(|e| anyhow!("sources[{index}]: {e}"))
            })
            .collect()
    }

    pub fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.broker.nonce_ttl_seconds)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.tokens.ttl_seconds.unwrap_or(self.broker.nonce_ttl_seconds))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.broker.sweep_interval_seconds)
    }

    /// Configured host, or `localhost` (which only works on this machine).
    pub fn callback_host(&self) -> &str {
        match self.callback.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host,
            _ => DEFAULT_CALLBACK_HOST,
        }
    }

    pub fn callback_host_is_fallback(&self) -> bool {
        self.callback
            .host
            .as_deref()
            .is_none_or(|host| host.trim().is_empty())
    }

    pub fn callback_base_url(&self) -> String {
        format!(
            "http://{}:{}/callback",
            self.callback_host(),
            self.callback.port
        )
    }

    pub fn ntfy_topic(&self) -> Result<&str> {
        self.ntfy
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .ok_or_else(|| anyhow!("ntfy topic is not configured (set NTFY_TOPIC or ntfy.topic)"))
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".opencode-pilot").join("config.toml")
}
