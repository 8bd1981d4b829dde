//! Validate command - validate configuration files.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use tristream_config::{ConfigLoader, ProductionConfig};

use crate::output::{format_bytes, format_kv_list, print_error, print_success, print_warning};

/// Validate command arguments.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Configuration file to validate.
    pub config_file: String,

    /// Print a summary of the loaded configuration.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Execute the validate command.
pub fn execute(args: ValidateArgs, json: bool) -> Result<()> {
    if !json {
        println!(
            "\n{} {}\n",
            "Validating".bright_green().bold(),
            args.config_file.bright_cyan()
        );
    }

    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    let config = match ConfigLoader::new().with_file(&args.config_file).load() {
        Ok(config) => Some(config),
        Err(e) => {
            errors.push(e.to_string());
            None
        }
    };

    if let Some(ref config) = config {
        warnings.extend(lint(config));

        if !json && args.verbose {
            println!("  {}", "Configuration Summary".bright_cyan().underline());
            println!("{}\n", format_kv_list(&summary(config)));
        }
    }

    if json {
        let result = serde_json::json!({
            "file": args.config_file,
            "valid": errors.is_empty(),
            "errors": errors,
            "warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for error in &errors {
            print_error(error);
        }
        for warning in &warnings {
            print_warning(warning);
        }
        if errors.is_empty() {
            print_success(&format!("Configuration is {}", "valid".bright_green().bold()));
        } else {
            print_error(&format!("Configuration is {}", "invalid".bright_red().bold()));
        }
    }

    if !errors.is_empty() {
        anyhow::bail!("Configuration validation failed");
    }

    Ok(())
}

/// Settings that load fine but are likely mistakes.
fn lint(config: &ProductionConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.enable_speculative && config.draft_model_path.is_none() {
        warnings.push("speculative decoding is enabled without draft_model_path".to_string());
    }
    if !config.enable_state_persistence && config.state.auto_save_interval_ms > 0 {
        warnings.push("state.auto_save_interval_ms is set but persistence is disabled".to_string());
    }
    if config.batch.max_tokens_per_batch > config.batch.max_kv_cache_tokens {
        warnings.push(format!(
            "batch.max_tokens_per_batch ({}) exceeds batch.max_kv_cache_tokens ({})",
            config.batch.max_tokens_per_batch, config.batch.max_kv_cache_tokens
        ));
    }
    if !config.pool.grow_on_demand && config.pool.prealloc_arenas == 0 {
        warnings.push("pool has no preallocated arenas and cannot grow".to_string());
    }

    warnings
}

fn summary(config: &ProductionConfig) -> Vec<(&'static str, String)> {
    vec![
        ("Model", config.model_path.clone()),
        ("Context size", config.engine.context_size.to_string()),
        ("Max batch size", config.batch.max_batch_size.to_string()),
        ("KV cache tokens", config.batch.max_kv_cache_tokens.to_string()),
        ("Pool capacity", format_bytes(config.pool.max_capacity() as u64)),
        ("Speculative", config.enable_speculative.to_string()),
        ("State dir", config.state.storage_dir.display().to_string()),
        ("Recovery", format!("{:?}", config.state.recovery_mode)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lint_flags_speculative_without_draft() {
        let mut config = ProductionConfig::default();
        config.enable_speculative = true;
        config.draft_model_path = None;
        let warnings = lint(&config);
        assert!(warnings.iter().any(|w| w.contains("draft_model_path")));
    }

    #[test]
    fn test_lint_default_is_clean() {
        assert!(lint(&ProductionConfig::default()).is_empty());
    }

    #[test]
    fn test_execute_rejects_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "num_streams: 4").unwrap();

        let args = ValidateArgs {
            config_file: path.display().to_string(),
            verbose: false,
        };
        assert!(execute(args, true).is_err());
    }

    #[test]
    fn test_execute_accepts_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.toml");
        std::fs::write(&path, "model_path = \"synthetic\"\n").unwrap();

        let args = ValidateArgs {
            config_file: path.display().to_string(),
            verbose: true,
        };
        execute(args, false).unwrap();
    }
}
