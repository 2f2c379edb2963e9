//! Tracing subscriber setup.
//!
//! Components never touch a global logger; they emit `tracing` events and the
//! binary decides where those go by calling [`init_tracing`] once at startup.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging section of the instance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// fails with [`ObservabilityError::Install`].
pub fn init_tracing(config: &LoggingConfig) -> Result<(), ObservabilityError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let result = match config.format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .try_init(),
    };

    result.map_err(|e| ObservabilityError::Install(e.to_string()))
}
