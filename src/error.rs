use thiserror::Error;

/// Fatal configuration problems, raised synchronously at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("invalid endpoint URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

/// Failures of a single capture attempt. Terminal for that attempt;
/// the caller decides whether to start over.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to acquire capture device '{device}': {source}")]
    DeviceAcquisition {
        device: String,
        source: alsa::Error,
    },
    #[error("failed to configure capture device '{device}': {source}")]
    DeviceSetup {
        device: String,
        source: alsa::Error,
    },
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}
