//! Speculative decoding configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Rule deciding whether a drafted token survives verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptanceMethod {
    /// Target logprob must be at least the draft logprob
    Greedy,
    /// Target/draft likelihood ratio must clear `ln(typical_p)`
    #[default]
    Typical,
    /// Target probability must reach `nucleus_p`
    Nucleus,
}

impl AcceptanceMethod {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AcceptanceMethod::Greedy => "greedy",
            AcceptanceMethod::Typical => "typical",
            AcceptanceMethod::Nucleus => "nucleus",
        }
    }
}

impl fmt::Display for AcceptanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for AcceptanceMethod {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl FromStr for AcceptanceMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "typical" => Ok(Self::Typical),
            "nucleus" => Ok(Self::Nucleus),
            other => Err(format!("unknown acceptance method: {}", other)),
        }
    }
}

/// Speculative decoding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_accept_rates"))]
pub struct SpeculativeConfig {
    /// Draft tokens proposed per round.
    #[serde(default = "default_draft_tokens")]
    #[validate(range(min = 1))]
    pub draft_tokens: usize,

    /// Ceiling for adaptive draft length.
    #[serde(default = "default_max_draft_tokens")]
    #[validate(range(min = 1, max = 64))]
    pub max_draft_tokens: usize,

    /// Acceptance rule.
    #[serde(default)]
    pub acceptance_method: AcceptanceMethod,

    /// Threshold for typical acceptance.
    #[serde(default = "default_typical_p")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub typical_p: f32,

    /// Threshold for nucleus acceptance.
    #[serde(default = "default_nucleus_p")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub nucleus_p: f32,

    /// Draft sampling temperature, passed to the draft model.
    #[serde(default = "default_temperature")]
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f32,

    /// Adjust draft length from observed acceptance.
    #[serde(default = "default_true")]
    pub adaptive_draft: bool,

    /// Shrink the draft below this acceptance rate.
    #[serde(default = "default_min_accept_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_accept_rate: f32,

    /// Grow the draft above this acceptance rate.
    #[serde(default = "default_max_accept_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub max_accept_rate: f32,

    /// Initial draft length per stream.
    #[serde(default = "default_stream_draft_tokens")]
    pub stream_draft_tokens: [usize; 3],
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            draft_tokens: default_draft_tokens(),
            max_draft_tokens: default_max_draft_tokens(),
            acceptance_method: AcceptanceMethod::Typical,
            typical_p: default_typical_p(),
            nucleus_p: default_nucleus_p(),
            temperature: default_temperature(),
            adaptive_draft: true,
            min_accept_rate: default_min_accept_rate(),
            max_accept_rate: default_max_accept_rate(),
            stream_draft_tokens: default_stream_draft_tokens(),
        }
    }
}

fn validate_accept_rates(config: &SpeculativeConfig) -> Result<(), ValidationError> {
    if config.min_accept_rate > config.max_accept_rate {
        let mut err = ValidationError::new("accept_rates");
        err.message = Some("min_accept_rate must not exceed max_accept_rate".into());
        return Err(err);
    }
    if config.draft_tokens > config.max_draft_tokens {
        let mut err = ValidationError::new("draft_tokens");
        err.message = Some("draft_tokens must not exceed max_draft_tokens".into());
        return Err(err);
    }
    Ok(())
}

fn default_draft_tokens() -> usize {
    4
}

fn default_max_draft_tokens() -> usize {
    8
}

fn default_typical_p() -> f32 {
    0.9
}

fn default_nucleus_p() -> f32 {
    0.95
}

fn default_temperature() -> f32 {
    1.0
}

fn default_min_accept_rate() -> f32 {
    0.3
}

fn default_max_accept_rate() -> f32 {
    0.8
}

fn default_stream_draft_tokens() -> [usize; 3] {
    [4, 4, 4]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_speculative_config() {
        let config = SpeculativeConfig::default();
        assert_eq!(config.draft_tokens, 4);
        assert_eq!(config.acceptance_method, "typical");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_accept_rates_rejected() {
        let config = SpeculativeConfig {
            min_accept_rate: 0.9,
            max_accept_rate: 0.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acceptance_method_parse() {
        assert_eq!(
            "Nucleus".parse::<AcceptanceMethod>().unwrap(),
            AcceptanceMethod::Nucleus
        );
        assert!("beam".parse::<AcceptanceMethod>().is_err());
    }
}
