//! Tristream Configuration Management.
//!
//! Configuration structures for every engine component plus loading and
//! validation. Files may be YAML, TOML or JSON; environment variables
//! override file values.
//!
//! # Example
//!
//! ```rust,ignore
//! use tristream_config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .with_file("tristream.yaml")
//!     .with_env_prefix("TRISTREAM")
//!     .load()?;
//!
//! println!("context: {}", config.engine.context_size);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod batch;
pub mod engine;
pub mod error;
pub mod loader;
pub mod pool;
pub mod production;
pub mod speculative;
pub mod state;
pub mod validation;

pub use batch::{BatchConfig, EvictionPolicy};
pub use engine::EngineParams;
pub use error::ConfigError;
pub use loader::{ConfigFormat, ConfigLoader};
pub use pool::PoolConfig;
pub use production::ProductionConfig;
pub use speculative::{AcceptanceMethod, SpeculativeConfig};
pub use state::{RecoveryMode, StateConfig};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    #[validate(length(min = 1))]
    pub level: String,

    /// Log format (json, pretty, compact).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus collectors.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Period of the metrics refresh loop in milliseconds.
    #[serde(default = "default_metrics_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_metrics_interval_ms(),
        }
    }
}

impl MetricsConfig {
    /// Refresh period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}
