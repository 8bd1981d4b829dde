//! Generation request submitted to the engine.
//!
//! Prompts arrive already tokenized; the engine never sees raw text on the
//! input side.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{StreamId, TokenId};

/// A generation request (already tokenized).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Caller-visible request id
    #[serde(default = "default_request_id")]
    pub request_id: String,

    /// Stream the request runs on
    pub stream: StreamId,

    /// Caller-defined step counter carried through to the response
    #[serde(default)]
    pub step: u64,

    /// Prompt token ids
    pub prompt_tokens: Vec<TokenId>,

    /// Maximum number of tokens to generate
    pub max_new_tokens: usize,

    /// Sampling temperature, passed through to the backend
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling parameter, passed through to the backend
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Top-k sampling parameter, passed through to the backend
    #[serde(default)]
    pub top_k: u32,

    /// Priority override; stream priority is used when absent
    #[serde(default)]
    pub priority: Option<u32>,

    /// Opaque caller metadata echoed into the response
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

impl InferenceRequest {
    /// Create a request with default sampling parameters.
    pub fn new(stream: StreamId, prompt_tokens: Vec<TokenId>, max_new_tokens: usize) -> Self {
        Self {
            request_id: default_request_id(),
            stream,
            step: 0,
            prompt_tokens,
            max_new_tokens,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: 0,
            priority: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the request id.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Set the caller step.
    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Override the scheduling priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether there is nothing to generate.
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_empty() || self.max_new_tokens == 0
    }
}
