use std::env;

use crate::error::ConfigError;

/// Runtime configuration, read from the process environment.
///
/// Both endpoint base URLs are required; a missing one is a fatal
/// `ConfigError` at construction, never a deferred failure mid-session.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket base URL, e.g. "ws://localhost:8000"
    pub ws_url: String,
    /// HTTP API base URL, e.g. "http://localhost:8000"
    pub api_url: String,
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// Desired capture sample rate (may be negotiated by hardware)
    pub sample_rate: u32,
    /// Desired capture channel count
    pub channels: u32,
    /// Desired samples per processing quantum
    pub period_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ws_url: require("MEETLINK_WS_URL")?,
            api_url: require("MEETLINK_API_URL")?,
            capture_device: env::var("MEETLINK_CAPTURE_DEVICE")
                .unwrap_or_else(|_| "default".to_string()),
            sample_rate: 16_000,
            channels: 1,
            period_size: 128,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingVar(var)),
    }
}
