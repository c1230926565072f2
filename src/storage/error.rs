//! Error types for gateway operations

use std::fmt;

use crate::config::ConfigError;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors that can occur while preparing a backend or persisting a record
#[derive(Debug)]
pub enum GatewayError {
    /// Backend unreachable or misconfigured during schema preparation
    Setup(String),

    /// SSH tunnel could not be established
    Tunnel(String),

    /// Engine or session could not be opened
    Connection(String),

    /// Insert or commit failed
    Persistence(String),

    /// Invalid configuration
    InvalidConfig(String),

    /// Payload or stored document could not be (de)serialized
    Serialization(String),
}

impl GatewayError {
    /// Re-label any error raised while running `setup()` as a setup failure,
    /// keeping the original cause in the message.
    pub fn into_setup(self) -> Self {
        match self {
            GatewayError::Setup(_) | GatewayError::InvalidConfig(_) => self,
            other => GatewayError::Setup(other.to_string()),
        }
    }

    /// Short machine-friendly name of the failure class, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Setup(_) => "setup",
            GatewayError::Tunnel(_) => "tunnel",
            GatewayError::Connection(_) => "connection",
            GatewayError::Persistence(_) => "persistence",
            GatewayError::InvalidConfig(_) => "config",
            GatewayError::Serialization(_) => "serialization",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Setup(msg) => write!(f, "storage setup failed: {}", msg),
            GatewayError::Tunnel(msg) => write!(f, "failed to establish SSH tunnel: {}", msg),
            GatewayError::Connection(msg) => {
                write!(f, "failed to connect to storage backend: {}", msg)
            }
            GatewayError::Persistence(msg) => write!(f, "failed to persist record: {}", msg),
            GatewayError::InvalidConfig(msg) => write!(f, "invalid storage configuration: {}", msg),
            GatewayError::Serialization(msg) => write!(f, "record serialization error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ConfigError> for GatewayError {
    fn from(err: ConfigError) -> Self {
        GatewayError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}
