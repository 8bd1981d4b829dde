//! Tristream CLI.

pub mod commands;
pub mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tristream_config::{loader::DEFAULT_ENV_PREFIX, ConfigLoader, ProductionConfig};

/// Tristream - three-stream inference serving engine.
#[derive(Parser, Debug)]
#[command(
    name = "tristream",
    version,
    about = "Inference serving engine with per-stream pools, continuous batching and speculative decoding",
    long_about = "Tristream serves three independent token streams from one engine.\n\n\
                  Features:\n\
                  • Arena memory pools per stream\n\
                  • Continuous batching over an LRU-managed KV cache\n\
                  • Chain and tree speculative decoding\n\
                  • Versioned binary state snapshots"
)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path.
    #[arg(short, long, global = true, env = "TRISTREAM_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

/// CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic workload through the engine.
    Run(commands::run::RunArgs),

    /// Validate a configuration file.
    Validate(commands::validate::ValidateArgs),

    /// List or inspect state snapshots.
    #[command(subcommand)]
    Snapshots(commands::snapshots::SnapshotsCommand),

    /// Show version information.
    Version,
}

/// Load the configuration from `path`, or from environment overrides
/// over defaults when no path is given.
pub fn load_config(path: Option<&str>) -> Result<ProductionConfig> {
    let mut loader = ConfigLoader::new().with_env_prefix(DEFAULT_ENV_PREFIX);
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader
        .load()
        .with_context(|| match path {
            Some(path) => format!("failed to load configuration from {}", path),
            None => "failed to load configuration".to_string(),
        })
}
