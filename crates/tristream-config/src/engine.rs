//! Model execution parameters passed through to the compute backend.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Execution parameters for the compute backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct EngineParams {
    /// Context window in tokens.
    #[serde(default = "default_context_size")]
    #[validate(range(min = 1))]
    pub context_size: usize,

    /// Backend micro-batch size in tokens.
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// Backend worker threads, 0 lets the backend decide.
    #[serde(default)]
    pub threads: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            context_size: default_context_size(),
            batch_size: default_batch_size(),
            threads: 0,
        }
    }
}

fn default_context_size() -> usize {
    4096
}

fn default_batch_size() -> usize {
    512
}
