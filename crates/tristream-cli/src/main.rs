//! Tristream CLI entry point.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use tristream_cli::{load_config, Cli, Commands};
use tristream_metrics::tracing_setup::{init_tracing, LogFormat, TracingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file unless overridden on the command line.
    let logging = load_config(cli.config.as_deref())
        .map(|config| config.logging)
        .unwrap_or_default();
    let mut tracing_config = TracingConfig::from_names(
        cli.log_level.as_deref().unwrap_or(&logging.level),
        &logging.format,
    );
    if cli.json {
        tracing_config.format = LogFormat::Json;
    }
    init_tracing(tracing_config)?;

    match cli.command {
        Commands::Run(args) => {
            tristream_cli::commands::run::execute(args, cli.config, cli.json).await?;
        }
        Commands::Validate(args) => {
            tristream_cli::commands::validate::execute(args, cli.json)?;
        }
        Commands::Snapshots(command) => {
            tristream_cli::commands::snapshots::execute(command, cli.config, cli.json)?;
        }
        Commands::Version => {
            print_version(cli.json)?;
        }
    }

    Ok(())
}

/// Print version information.
fn print_version(json: bool) -> Result<()> {
    if json {
        let version = serde_json::json!({
            "name": "tristream",
            "version": env!("CARGO_PKG_VERSION"),
            "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            "state_format": tristream_state::FORMAT_VERSION,
        });
        println!("{}", serde_json::to_string_pretty(&version)?);
    } else {
        println!("{} {}", "tristream".bright_green().bold(), env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
        println!("State format: v{}", tristream_state::FORMAT_VERSION);
        println!();
        println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    }
    Ok(())
}
