//! Caller-facing response produced when a sequence finishes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{FinishReason, SequenceId, StreamId, TokenId};

/// Result of one generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Request id copied from the request
    pub request_id: String,
    /// Sequence that produced this response
    pub sequence_id: SequenceId,
    /// Stream the request ran on
    pub stream: StreamId,
    /// Caller step copied from the request
    pub step: u64,
    /// Concatenated text of the generated tokens
    pub output: String,
    /// Generated token ids
    pub tokens: Vec<TokenId>,
    /// Number of prompt tokens
    pub prompt_tokens: usize,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Wall time from submission to completion
    pub latency_ms: u64,
    /// Generation throughput
    pub tokens_per_sec: f64,
    /// Metadata copied from the request
    pub metadata: HashMap<String, String>,
}

impl InferenceResponse {
    /// Number of generated tokens.
    pub fn completion_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sequence finished normally.
    pub fn is_success(&self) -> bool {
        self.finish_reason.is_success()
    }
}
