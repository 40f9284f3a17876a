//! Process-wide logging setup.
//!
//! Library code logs through both `log` and `tracing`; `init_logging`
//! bridges the former into the latter and installs one subscriber.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to bridge log records into tracing: {0}")]
    Bridge(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Installs the global subscriber. Call once, before any work starts.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    tracing_log::LogTracer::init().map_err(|e| LoggingError::Bridge(e.to_string()))?;

    let filter = build_filter(&config.level);

    let installed = match config.format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true)),
        ),
    };

    installed.map_err(|e| LoggingError::Subscriber(e.to_string()))
}

/// `RUST_LOG` when set and valid, else the configured level, else `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_configured_level_used_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(build_filter("debug").to_string(), "debug");
        assert_eq!(build_filter("tms=trace").to_string(), "tms=trace");
    }

    #[test]
    #[serial]
    fn test_rust_log_wins() {
        std::env::set_var("RUST_LOG", "warn");
        assert_eq!(build_filter("debug").to_string(), "warn");
        std::env::remove_var("RUST_LOG");
    }
}
