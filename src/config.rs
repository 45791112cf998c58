use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-reasoner";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 300_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing upstream api key (set REASON_RELAY_API_KEY or DEEPSEEK_API_KEY)")]
    MissingApiKey,
    #[error("invalid REASON_RELAY_PORT {0:?}")]
    InvalidPort(String),
    #[error("invalid REASON_RELAY_REQUEST_TIMEOUT_MS {0:?}")]
    InvalidTimeout(String),
    #[error("invalid listen address {0}")]
    InvalidListen(String),
}

/// Process settings consumed by the relay.
#[derive(Clone)]
pub struct Settings {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model_name", &self.model_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl Settings {
    /// Reads settings from the process environment, loading `.env` first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                tracing::warn!("failed to load .env file: {err}");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = read("REASON_RELAY_API_KEY")
            .or_else(|| read("DEEPSEEK_API_KEY"))
            .ok_or(ConfigError::MissingApiKey)?;
        let base_url =
            read("REASON_RELAY_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model_name = read("REASON_RELAY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let host = read("REASON_RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match read("REASON_RELAY_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(raw))?,
            None => DEFAULT_PORT,
        };
        let request_timeout_ms = match read("REASON_RELAY_REQUEST_TIMEOUT_MS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => return Err(ConfigError::InvalidTimeout(raw)),
            },
            None => DEFAULT_REQUEST_TIMEOUT_MS,
        };

        Ok(Self {
            api_key: api_key.trim().to_string(),
            base_url: base_url.trim().to_string(),
            model_name: model_name.trim().to_string(),
            host: host.trim().to_string(),
            port,
            request_timeout_ms,
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        raw.parse().map_err(|err: std::net::AddrParseError| {
            ConfigError::InvalidListen(format!("{raw}: {err}"))
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
