//! Cross-field configuration checks that field-level attributes cannot express.

use crate::error::ConfigError;
use crate::ProductionConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

/// Validate a configuration.
pub fn validate_config(config: &ProductionConfig) -> Result<(), ConfigError> {
    validate_pool_config(config)?;
    validate_batch_config(config)?;
    validate_engine_config(config)?;
    validate_logging_config(config)?;
    Ok(())
}

fn validate_pool_config(config: &ProductionConfig) -> Result<(), ConfigError> {
    let pool = &config.pool;

    if !pool.alignment.is_power_of_two() {
        return Err(ConfigError::invalid_value(
            "pool.alignment",
            "must be a power of 2",
        ));
    }

    if pool.min_block_size > pool.max_block_size {
        return Err(ConfigError::invalid_value(
            "pool.min_block_size",
            "must not exceed pool.max_block_size",
        ));
    }

    if pool.prealloc_arenas > pool.max_arenas {
        return Err(ConfigError::invalid_value(
            "pool.prealloc_arenas",
            "must not exceed pool.max_arenas",
        ));
    }

    Ok(())
}

fn validate_batch_config(config: &ProductionConfig) -> Result<(), ConfigError> {
    let batch = &config.batch;

    if batch.preferred_batch_size > batch.max_batch_size {
        return Err(ConfigError::invalid_value(
            "batch.preferred_batch_size",
            "must not exceed batch.max_batch_size",
        ));
    }

    // A single prompt must be able to fit into an empty cache.
    if batch.max_kv_cache_tokens < config.engine.context_size.min(batch.max_tokens_per_batch) {
        return Err(ConfigError::invalid_value(
            "batch.max_kv_cache_tokens",
            "must hold at least one full context",
        ));
    }

    Ok(())
}

fn validate_engine_config(config: &ProductionConfig) -> Result<(), ConfigError> {
    if config.enable_gpu && config.gpu_devices.is_empty() {
        return Err(ConfigError::invalid_value(
            "gpu_devices",
            "at least one device is required when enable_gpu is set",
        ));
    }

    if let Some(ref draft) = config.draft_model_path {
        if draft.is_empty() {
            return Err(ConfigError::invalid_value(
                "draft_model_path",
                "must not be empty when set",
            ));
        }
    }

    Ok(())
}

fn validate_logging_config(config: &ProductionConfig) -> Result<(), ConfigError> {
    let level = config.logging.level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::invalid_value(
            "logging.level",
            format!("must be one of: {}", LOG_LEVELS.join(", ")),
        ));
    }

    let format = config.logging.format.to_lowercase();
    if !LOG_FORMATS.contains(&format.as_str()) {
        return Err(ConfigError::invalid_value(
            "logging.format",
            format!("must be one of: {}", LOG_FORMATS.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_power_of_two() {
        let mut config = ProductionConfig::default();
        config.pool.alignment = 48;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "pool.alignment"
        ));
    }

    #[test]
    fn test_preferred_batch_size_bound() {
        let mut config = ProductionConfig::default();
        config.batch.preferred_batch_size = config.batch.max_batch_size + 1;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_gpu_without_devices() {
        let config = ProductionConfig::default().with_gpu(Vec::<u32>::new());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_unknown_log_level() {
        let mut config = ProductionConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(validate_config(&config).is_err());
    }
}
