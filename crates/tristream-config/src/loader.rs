//! Configuration loader.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::ProductionConfig;

/// Default environment variable prefix.
pub const DEFAULT_ENV_PREFIX: &str = "TRISTREAM";

/// Configuration file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`)
    Yaml,
    /// TOML (`.toml`)
    Toml,
    /// JSON (`.json`)
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match ext.as_deref() {
            Some("yaml") | Some("yml") => Some(Self::Yaml),
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }

    /// Parse content in this format.
    pub fn parse<T: serde::de::DeserializeOwned>(&self, content: &str) -> Result<T, ConfigError> {
        match self {
            Self::Yaml => serde_yaml::from_str(content).map_err(ConfigError::from),
            Self::Toml => toml::from_str(content).map_err(ConfigError::from),
            Self::Json => serde_json::from_str(content).map_err(ConfigError::from),
        }
    }
}

/// Configuration loader.
///
/// Precedence: defaults, then the file, then environment overrides.
/// The result is validated before it is returned.
pub struct ConfigLoader {
    file_path: Option<PathBuf>,
    env_prefix: Option<String>,
    defaults: ProductionConfig,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new() -> Self {
        Self {
            file_path: None,
            env_prefix: None,
            defaults: ProductionConfig::default(),
        }
    }

    /// Set the config file path.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Set the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Set default values used when no file is given.
    pub fn with_defaults(mut self, defaults: ProductionConfig) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load the configuration.
    pub fn load(self) -> Result<ProductionConfig, ConfigError> {
        let mut config = match self.file_path {
            Some(ref path) => load_from_file(path)?,
            None => self.defaults.clone(),
        };

        if let Some(ref prefix) = self.env_prefix {
            apply_env_overrides(&mut config, prefix, |name| std::env::var(name).ok())?;
        }

        config.validate()?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_from_file(path: &Path) -> Result<ProductionConfig, ConfigError> {
    debug!("Loading configuration from {}", path.display());

    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let content = std::fs::read_to_string(path)?;

    let format = ConfigFormat::from_extension(path)
        .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;

    let config: ProductionConfig = format.parse(&content)?;

    info!("Loaded configuration from {}", path.display());

    Ok(config)
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env(name, format!("cannot parse '{}'", value)))
}

/// Apply `<PREFIX>_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(
    config: &mut ProductionConfig,
    prefix: &str,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |suffix: &str| {
        let name = format!("{}_{}", prefix, suffix);
        lookup(&name).map(|value| (name, value))
    };

    if let Some((_, val)) = var("MODEL_PATH") {
        config.model_path = val;
    }
    if let Some((_, val)) = var("DRAFT_MODEL") {
        *config = std::mem::take(config).with_draft_model(val);
    }
    if let Some((name, val)) = var("CONTEXT_SIZE") {
        config.engine.context_size = parse_var(&name, &val)?;
    }
    if let Some((name, val)) = var("BATCH_SIZE") {
        config.engine.batch_size = parse_var(&name, &val)?;
    }
    if let Some((name, val)) = var("MAX_BATCH_SIZE") {
        config.batch.max_batch_size = parse_var(&name, &val)?;
    }
    if let Some((_, val)) = var("STATE_DIR") {
        config.state.storage_dir = PathBuf::from(val);
    }
    if let Some((name, val)) = var("GPU_DEVICES") {
        let devices = val
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_var::<u32>(&name, s))
            .collect::<Result<Vec<_>, _>>()?;
        *config = std::mem::take(config).with_gpu(devices);
    }
    if let Some((_, val)) = var("LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some((_, val)) = var("LOG_FORMAT") {
        config.logging.format = val;
    }

    Ok(())
}

/// Load configuration from default locations.
pub fn load_default_config() -> Result<ProductionConfig, ConfigError> {
    let paths = ["tristream.yaml", "tristream.yml", "tristream.toml", "tristream.json"];

    for path in &paths {
        if Path::new(path).exists() {
            return ConfigLoader::new()
                .with_file(*path)
                .with_env_prefix(DEFAULT_ENV_PREFIX)
                .load();
        }
    }

    ConfigLoader::new().with_env_prefix(DEFAULT_ENV_PREFIX).load()
}
