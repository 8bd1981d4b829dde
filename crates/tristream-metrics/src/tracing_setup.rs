//! Tracing setup and configuration.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::MetricsError;

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level.
    pub level: Level,

    /// Log format.
    pub format: LogFormat,

    /// Enable span events.
    pub span_events: bool,

    /// Include the emitting module path.
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Build from textual level and format, falling back to defaults.
    pub fn from_names(level: &str, format: &str) -> Self {
        Self {
            level: level.parse().unwrap_or(Level::INFO),
            format: format.parse().unwrap_or(LogFormat::Pretty),
            ..Self::default()
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format.
    Pretty,

    /// Compact format.
    Compact,

    /// JSON format.
    Json,
}

impl FromStr for LogFormat {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            other => Err(MetricsError::TracingError(format!(
                "unknown log format: {}",
                other
            ))),
        }
    }
}

/// Initialize tracing.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: TracingConfig) -> Result<(), MetricsError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_span_events(span_events)
                        .with_target(config.with_target)
                        .with_thread_ids(true),
                )
                .try_init()
                .map_err(|e| MetricsError::TracingError(e.to_string()))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_span_events(span_events)
                        .with_target(config.with_target),
                )
                .try_init()
                .map_err(|e| MetricsError::TracingError(e.to_string()))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .pretty()
                        .with_span_events(span_events)
                        .with_target(config.with_target)
                        .with_thread_names(true),
                )
                .try_init()
                .map_err(|e| MetricsError::TracingError(e.to_string()))?;
        }
    }

    Ok(())
}

/// Create a span for one sequence.
#[macro_export]
macro_rules! sequence_span {
    ($sequence:expr, $stream:expr) => {
        tracing::info_span!("sequence", sequence = %$sequence, stream = %$stream)
    };
}

/// Create a span for one batch step.
#[macro_export]
macro_rules! batch_span {
    ($phase:expr, $size:expr) => {
        tracing::debug_span!("batch", phase = %$phase, size = $size)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_config_from_names() {
        let config = TracingConfig::from_names("debug", "compact");
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Compact);

        let fallback = TracingConfig::from_names("loud", "fancy");
        assert_eq!(fallback.level, Level::INFO);
        assert_eq!(fallback.format, LogFormat::Pretty);
    }
}
