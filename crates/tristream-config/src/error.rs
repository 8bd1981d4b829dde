//! Configuration error types.

use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    /// Validation error.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error.
    #[error("Environment variable {name}: {message}")]
    EnvError {
        /// Variable name
        name: String,
        /// What was wrong with it
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error.
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid value.
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted field path
        field: String,
        /// What was wrong with it
        message: String,
    },

    /// Unsupported format.
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        let mut messages = Vec::new();
        collect_messages("", &errors, &mut messages);
        messages.sort();
        ConfigError::ValidationError(messages.join("; "))
    }
}

/// Flatten nested validation errors into `path: message` strings.
fn collect_messages(prefix: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                let msgs: Vec<String> = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("validation failed for {}", e.code))
                    })
                    .collect();
                out.push(format!("{}: {}", path, msgs.join(", ")));
            }
            ValidationErrorsKind::Struct(inner) => collect_messages(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (idx, inner) in items {
                    collect_messages(&format!("{}[{}]", path, idx), inner, out);
                }
            }
        }
    }
}

impl ConfigError {
    /// Create an invalid value error.
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an environment variable error.
    pub fn env(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EnvError {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for tristream_core::Error {
    fn from(err: ConfigError) -> Self {
        tristream_core::Error::Config(err.to_string())
    }
}
