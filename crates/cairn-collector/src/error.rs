//! Collector error types.

use std::fmt;

use crate::config::ConfigError;

/// Errors that can terminate the collector runtime.
#[derive(Debug)]
pub enum CollectorError {
    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// The shared socket became unusable.
    Transport(String),

    /// Event sink setup failed.
    Sink(String),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {}", err),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Sink(msg) => write!(f, "sink error: {}", msg),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for CollectorError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
