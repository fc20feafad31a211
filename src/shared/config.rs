use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/mobileBE";
pub const DEFAULT_SOCKET_URL: &str = "ws://localhost:8080/mobileBE/ws";
pub const DEFAULT_API_GREENHOUSE_URL: &str = "http://localhost:8000/api/v1/greenhouses";
pub const DEFAULT_AUTH_URL: &str = "http://localhost:3000";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STORAGE_PATH: &str = ".greenhouse/secure-store.json";

/// Configuration for the greenhouse client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Mobile backend base (list, get, analyze, history)
    pub api_base_url: String,
    /// STOMP-over-WebSocket endpoint
    pub socket_url: String,
    /// Greenhouse service base (field settings and control)
    pub api_greenhouse_url: String,
    /// Auth service base (login, register)
    pub auth_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    /// Backing file of the secure key-value store
    pub storage_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            api_greenhouse_url: DEFAULT_API_GREENHOUSE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
        }
    }
}

impl ClientConfig {
    /// Create a new ClientConfig from environment variables
    /// Unset variables fall back to the built-in defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create a ClientConfig from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = |key: &str, default: &str| -> String {
            let raw = value(key).unwrap_or_else(|| default.to_string());
            raw.trim().trim_end_matches('/').to_string()
        };

        let seconds = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            match value(key) {
                None => Ok(Duration::from_secs(default)),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: raw,
                    }),
                    Ok(secs) => Ok(Duration::from_secs(secs)),
                },
            }
        };

        Ok(ClientConfig {
            api_base_url: url("API_BASE_URL", DEFAULT_API_BASE_URL),
            socket_url: url("SOCKET_URL", DEFAULT_SOCKET_URL),
            api_greenhouse_url: url("API_GREENHOUSE_URL", DEFAULT_API_GREENHOUSE_URL),
            auth_url: url("AUTH_URL", DEFAULT_AUTH_URL),
            poll_interval: seconds("POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            request_timeout: seconds("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            storage_path: value("STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_PATH)),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}
