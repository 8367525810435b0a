//! Structured logging setup for aerohub
//!
//! - JSON, one object per line, by default
//! - Level from configuration, overridable with `AEROHUB_LOG`
//! - Installing twice is harmless; the first subscriber wins

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use super::{ObservabilityError, ObservabilityResult};

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "AEROHUB_LOG";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Json
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Logging section of the node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `aerohub::replication=debug`
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Check that the level parses as a filter directive.
    pub fn validate(&self) -> ObservabilityResult<()> {
        EnvFilter::try_new(&self.level)
            .map(|_| ())
            .map_err(|e| ObservabilityError::new(format!("invalid log level '{}': {}", self.level, e)))
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> ObservabilityResult<bool> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
            .map_err(|e| ObservabilityError::new(format!("invalid {}: {}", LOG_ENV, e)))?,
        _ => {
            config.validate()?;
            EnvFilter::try_new(&config.level)
                .map_err(|e| ObservabilityError::new(e.to_string()))?
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
    };
    Ok(installed.is_ok())
}
