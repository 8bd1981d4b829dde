//! Sequence lifecycle.
//!
//! A sequence is one generation request inside the batcher:
//!
//! ```text
//! Pending --> Running --> Complete
//!    |           |
//!    +-----------+------> Cancelled
//! ```
//!
//! `Pending -> Complete` is also permitted for no-op requests (empty prompt
//! or zero `max_new_tokens`).

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use tristream_core::{
    Error, FinishReason, InferenceRequest, InferenceResponse, Result, SequenceId, StreamId,
    TokenId,
};

use crate::kv_cache::SlotHandle;

/// Sequence state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceState {
    /// Submitted, waiting for a prefill batch.
    Pending,
    /// Prefilled; generating.
    Running,
    /// Finished normally.
    Complete,
    /// Cancelled before completion.
    Cancelled,
}

impl SequenceState {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SequenceState::Pending => "pending",
            SequenceState::Running => "running",
            SequenceState::Complete => "complete",
            SequenceState::Cancelled => "cancelled",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequenceState::Complete | SequenceState::Cancelled)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: SequenceState) -> bool {
        use SequenceState::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Complete) | (Pending, Cancelled)
                | (Running, Complete) | (Running, Cancelled)
        )
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation request tracked by the batcher.
#[derive(Debug)]
pub struct Sequence {
    id: SequenceId,
    request_id: String,
    stream: StreamId,
    step: u64,
    prompt_tokens: Vec<TokenId>,
    max_new_tokens: usize,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    priority: u32,
    metadata: HashMap<String, String>,

    generated: Vec<TokenId>,
    logprobs: Vec<f32>,
    text: String,

    state: SequenceState,
    finish_reason: Option<FinishReason>,
    kv_slot: Option<SlotHandle>,

    submitted_at: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Sequence {
    /// Create a pending sequence from a request.
    pub fn new(id: SequenceId, request: InferenceRequest, priority: u32) -> Self {
        Self {
            id,
            request_id: request.request_id,
            stream: request.stream,
            step: request.step,
            prompt_tokens: request.prompt_tokens,
            max_new_tokens: request.max_new_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            priority: request.priority.unwrap_or(priority),
            metadata: request.metadata,
            generated: Vec::new(),
            logprobs: Vec::new(),
            text: String::new(),
            state: SequenceState::Pending,
            finish_reason: None,
            kv_slot: None,
            submitted_at: Instant::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Sequence id.
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Caller request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Stream the sequence runs on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Caller step counter.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Scheduling priority (higher first).
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Prompt tokens.
    pub fn prompt_tokens(&self) -> &[TokenId] {
        &self.prompt_tokens
    }

    /// Generated tokens.
    pub fn generated_tokens(&self) -> &[TokenId] {
        &self.generated
    }

    /// Prompt followed by generated tokens.
    pub fn context(&self) -> Vec<TokenId> {
        let mut tokens = Vec::with_capacity(self.token_count());
        tokens.extend_from_slice(&self.prompt_tokens);
        tokens.extend_from_slice(&self.generated);
        tokens
    }

    /// Prompt plus generated token count.
    pub fn token_count(&self) -> usize {
        self.prompt_tokens.len() + self.generated.len()
    }

    /// Prompt length.
    pub fn prompt_len(&self) -> usize {
        self.prompt_tokens.len()
    }

    /// Generated length.
    pub fn generated_len(&self) -> usize {
        self.generated.len()
    }

    /// Generation limit.
    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    /// Tokens left before the length limit.
    pub fn remaining(&self) -> usize {
        self.max_new_tokens.saturating_sub(self.generated.len())
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Nucleus parameter.
    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Top-k parameter.
    pub fn top_k(&self) -> u32 {
        self.top_k
    }

    /// Generated text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current state.
    pub fn state(&self) -> SequenceState {
        self.state
    }

    /// Whether the sequence finished normally.
    pub fn is_complete(&self) -> bool {
        self.state == SequenceState::Complete
    }

    /// Whether the sequence is complete or cancelled.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A request that generates nothing.
    pub fn is_noop(&self) -> bool {
        self.prompt_tokens.is_empty() || self.max_new_tokens == 0
    }

    /// Still waiting for prefill.
    pub fn needs_prefill(&self) -> bool {
        self.state == SequenceState::Pending
    }

    /// Reason the sequence finished.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Move to `to`, rejecting illegal transitions.
    pub fn transition(&mut self, to: SequenceState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                sequence: self.id,
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            SequenceState::Running => self.started_at = Some(Instant::now()),
            SequenceState::Complete | SequenceState::Cancelled => {
                self.finished_at = Some(Instant::now())
            }
            SequenceState::Pending => {}
        }
        self.state = to;
        Ok(())
    }

    /// Transition to `Complete` with `reason`.
    pub fn complete(&mut self, reason: FinishReason) -> Result<()> {
        self.transition(SequenceState::Complete)?;
        self.finish_reason = Some(reason);
        Ok(())
    }

    /// Transition to `Cancelled` with `reason`.
    pub fn cancel(&mut self, reason: FinishReason) -> Result<()> {
        self.transition(SequenceState::Cancelled)?;
        self.finish_reason = Some(reason);
        Ok(())
    }

    /// Record a generated token.
    pub fn push_token(&mut self, id: TokenId, logprob: f32, text: &str) {
        self.generated.push(id);
        self.logprobs.push(logprob);
        self.text.push_str(text);
    }

    /// KV slot held by the sequence.
    pub fn kv_slot(&self) -> Option<SlotHandle> {
        self.kv_slot
    }

    /// Attach a KV slot.
    pub fn set_kv_slot(&mut self, slot: SlotHandle) {
        self.kv_slot = Some(slot);
    }

    /// Detach the KV slot. Returns it at most once.
    pub fn take_kv_slot(&mut self) -> Option<SlotHandle> {
        self.kv_slot.take()
    }

    /// Time spent pending.
    pub fn wait_time(&self) -> Duration {
        self.started_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.submitted_at)
    }

    /// Submission to completion (or now).
    pub fn latency(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.submitted_at)
    }

    /// Build the caller-facing response.
    pub fn to_response(&self) -> InferenceResponse {
        let latency = self.latency();
        let secs = latency.as_secs_f64();
        InferenceResponse {
            request_id: self.request_id.clone(),
            sequence_id: self.id,
            stream: self.stream,
            step: self.step,
            output: self.text.clone(),
            tokens: self.generated.clone(),
            prompt_tokens: self.prompt_tokens.len(),
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Error),
            latency_ms: latency.as_millis() as u64,
            tokens_per_sec: if secs > 0.0 {
                self.generated.len() as f64 / secs
            } else {
                0.0
            },
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(prompt: Vec<TokenId>, max_new: usize) -> Sequence {
        Sequence::new(
            SequenceId::new(1),
            InferenceRequest::new(StreamId::Alpha, prompt, max_new),
            3,
        )
    }

    #[test]
    fn test_token_count() {
        let mut seq = sequence(vec![1, 2, 3, 4, 5], 10);
        seq.push_token(6, -0.1, "a");
        seq.push_token(7, -0.2, "b");
        assert_eq!(seq.token_count(), 7);
        assert_eq!(seq.context(), vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(seq.remaining(), 8);
        assert_eq!(seq.text(), "ab");
    }

    #[test]
    fn test_is_complete_only_when_complete() {
        let mut seq = sequence(vec![1], 4);
        assert!(!seq.is_complete());
        seq.transition(SequenceState::Running).unwrap();
        assert!(!seq.is_complete());
        seq.complete(FinishReason::Length).unwrap();
        assert!(seq.is_complete());
        assert_eq!(seq.finish_reason(), Some(FinishReason::Length));
    }

    #[test]
    fn test_cancelled_is_terminal_not_complete() {
        let mut seq = sequence(vec![1], 4);
        seq.cancel(FinishReason::Cancelled).unwrap();
        assert!(seq.is_terminal());
        assert!(!seq.is_complete());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut seq = sequence(vec![1], 4);
        seq.transition(SequenceState::Running).unwrap();
        assert!(matches!(
            seq.transition(SequenceState::Pending),
            Err(Error::InvalidTransition { .. })
        ));
        seq.complete(FinishReason::Stop).unwrap();
        assert!(seq.cancel(FinishReason::Cancelled).is_err());
        assert!(seq.transition(SequenceState::Running).is_err());
    }

    #[test]
    fn test_noop_detection() {
        assert!(sequence(vec![], 4).is_noop());
        assert!(sequence(vec![1], 0).is_noop());
        assert!(!sequence(vec![1], 1).is_noop());

        let mut seq = sequence(vec![], 4);
        seq.complete(FinishReason::Empty).unwrap();
        let response = seq.to_response();
        assert_eq!(response.finish_reason, FinishReason::Empty);
        assert!(response.tokens.is_empty());
    }

    #[test]
    fn test_priority_override() {
        let request = InferenceRequest::new(StreamId::Gamma, vec![1], 1).with_priority(9);
        let seq = Sequence::new(SequenceId::new(2), request, 1);
        assert_eq!(seq.priority(), 9);
    }
}
