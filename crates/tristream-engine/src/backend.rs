//! Compute backend seam.
//!
//! The engine never runs a model itself. Each formed batch is handed to a
//! [`ComputeBackend`], which returns the next token(s) for every member
//! sequence. Calls are synchronous and run on the blocking thread pool.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use tristream_core::{Error, Result, SequenceId, TokenId};

use crate::batch::Batch;
use crate::speculative::{DraftModel, ScoredToken, TargetModel, TargetScore};

/// One generated token.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedToken {
    /// Token id
    pub id: TokenId,
    /// Log probability
    pub logprob: f32,
    /// Decoded text
    pub text: String,
    /// End of sequence
    pub is_eos: bool,
}

/// Tokens produced for one sequence by a step.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOutput {
    /// Sequence id
    pub sequence: SequenceId,
    /// Tokens in generation order
    pub tokens: Vec<GeneratedToken>,
}

/// Result of running a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutput {
    /// Batch id
    pub batch_id: u64,
    /// Per-sequence outputs
    pub outputs: Vec<SequenceOutput>,
}

impl BatchOutput {
    /// Output for `sequence`.
    pub fn get(&self, sequence: SequenceId) -> Option<&SequenceOutput> {
        self.outputs.iter().find(|o| o.sequence == sequence)
    }

    /// Tokens across all sequences.
    pub fn total_tokens(&self) -> usize {
        self.outputs.iter().map(|o| o.tokens.len()).sum()
    }
}

/// Executes batches.
pub trait ComputeBackend: Send + Sync {
    /// Backend name for logs and health.
    fn name(&self) -> &str;

    /// Run one step for every sequence in `batch`.
    fn run_batch(&self, batch: &Batch) -> Result<BatchOutput>;

    /// Decode a token id.
    fn token_text(&self, id: TokenId) -> String {
        format!("<{}>", id)
    }

    /// End-of-sequence token, if the backend has one.
    fn eos_token(&self) -> Option<TokenId> {
        None
    }
}

/// Parameters of the synthetic models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Vocabulary size; the EOS token is `vocab_size`
    pub vocab_size: u32,
    /// Emit EOS once this many tokens were generated
    pub eos_after: Option<usize>,
    /// Simulated compute time per batch
    pub step_delay_ms: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            eos_after: None,
            step_delay_ms: 0,
        }
    }
}

impl SyntheticConfig {
    /// Deterministic next token and its log probability.
    pub fn next_token(&self, context: &[TokenId]) -> ScoredToken {
        let last = context.last().copied().unwrap_or(0) as u64;
        let pos = context.len() as u64;
        let mut x = last
            .wrapping_mul(6364136223846793005)
            .wrapping_add(pos.wrapping_mul(1442695040888963407))
            .wrapping_add(0x9e3779b97f4a7c15);
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 29;
        let id = (x % self.vocab_size.max(1) as u64) as TokenId;
        let logprob = -(((x >> 40) % 1000) as f32 / 1000.0) - 0.01;
        ScoredToken::new(id, logprob)
    }

    /// End-of-sequence token id.
    pub fn eos_token(&self) -> TokenId {
        self.vocab_size
    }
}

/// Deterministic backend for tests, benchmarks and demos.
///
/// The next token is a hash of the last context token and the context
/// length, so identical contexts always produce identical output.
#[derive(Debug)]
pub struct SyntheticBackend {
    config: SyntheticConfig,
    failing: AtomicBool,
    batches: AtomicU64,
}

impl SyntheticBackend {
    /// Create a backend.
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            failing: AtomicBool::new(false),
            batches: AtomicU64::new(0),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Make subsequent batches fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Batches run so far.
    pub fn batches_run(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(SyntheticConfig::default())
    }
}

impl ComputeBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn run_batch(&self, batch: &Batch) -> Result<BatchOutput> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        if self.config.step_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.step_delay_ms));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::backend(format!("synthetic failure in batch {}", batch.id())));
        }

        let outputs = batch
            .entries()
            .iter()
            .map(|entry| {
                let eos = self
                    .config
                    .eos_after
                    .is_some_and(|after| entry.generated >= after);
                let token = if eos {
                    GeneratedToken {
                        id: self.config.eos_token(),
                        logprob: 0.0,
                        text: String::new(),
                        is_eos: true,
                    }
                } else {
                    let next = self.config.next_token(&entry.context);
                    GeneratedToken {
                        id: next.id,
                        logprob: next.logprob,
                        text: self.token_text(next.id),
                        is_eos: false,
                    }
                };
                SequenceOutput {
                    sequence: entry.sequence,
                    tokens: vec![token],
                }
            })
            .collect();

        trace!("Synthetic backend ran {} batch {}", batch.phase(), batch.id());
        Ok(BatchOutput {
            batch_id: batch.id(),
            outputs,
        })
    }

    fn token_text(&self, id: TokenId) -> String {
        if id == self.config.eos_token() {
            String::new()
        } else {
            format!(" t{}", id)
        }
    }

    fn eos_token(&self) -> Option<TokenId> {
        Some(self.config.eos_token())
    }
}

impl TargetModel for SyntheticBackend {
    fn score(&self, context: &[TokenId], draft: &[TokenId]) -> Result<Vec<TargetScore>> {
        let mut ctx = context.to_vec();
        let mut scores = Vec::with_capacity(draft.len() + 1);
        for &token in draft {
            let best = self.config.next_token(&ctx);
            let logprob = if token == best.id {
                best.logprob
            } else {
                best.logprob - 4.0
            };
            scores.push(TargetScore {
                logprob,
                best: best.id,
                best_logprob: best.logprob,
            });
            ctx.push(token);
        }
        let bonus = self.config.next_token(&ctx);
        scores.push(TargetScore {
            logprob: bonus.logprob,
            best: bonus.id,
            best_logprob: bonus.logprob,
        });
        Ok(scores)
    }
}

/// Draft model that agrees with [`SyntheticBackend`] except at every
/// `miss_every`-th drafted position (never, if zero).
#[derive(Debug, Clone)]
pub struct SyntheticDraft {
    config: SyntheticConfig,
    miss_every: usize,
}

impl SyntheticDraft {
    /// Create a draft model.
    pub fn new(config: SyntheticConfig, miss_every: usize) -> Self {
        Self { config, miss_every }
    }

    fn misses(&self, index: usize) -> bool {
        self.miss_every > 0 && (index + 1) % self.miss_every == 0
    }
}

impl DraftModel for SyntheticDraft {
    fn propose(&self, context: &[TokenId], n: usize, _temperature: f32) -> Result<Vec<ScoredToken>> {
        let mut ctx = context.to_vec();
        let mut drafted = Vec::with_capacity(n);
        for i in 0..n {
            let mut next = self.config.next_token(&ctx);
            if self.misses(i) {
                next.id = (next.id + 1) % self.config.vocab_size.max(1);
            }
            ctx.push(next.id);
            drafted.push(next);
        }
        Ok(drafted)
    }

    fn top_candidates(&self, context: &[TokenId], k: usize) -> Result<Vec<ScoredToken>> {
        let best = self.config.next_token(context);
        let vocab = self.config.vocab_size.max(1);
        // At a miss position the target's token is left out of the list.
        let shift = self.misses(context.len()) as u32;
        Ok((0..k.min(vocab as usize))
            .map(|i| {
                let id = (best.id + shift + i as u32) % vocab;
                ScoredToken::new(id, best.logprob - i as f32)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchEntry, BatchPhase};
    use tristream_core::StreamId;

    fn entry(seq: u64, context: Vec<TokenId>, generated: usize) -> BatchEntry {
        BatchEntry {
            sequence: SequenceId::new(seq),
            stream: StreamId::Alpha,
            input_len: 1,
            generated,
            remaining: 8,
            context,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
        }
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let backend = SyntheticBackend::default();
        let batch = Batch::new(1, BatchPhase::Decode, vec![entry(1, vec![1, 2, 3], 0)]);
        let a = backend.run_batch(&batch).unwrap();
        let b = backend.run_batch(&batch).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.total_tokens(), 1);
        assert!(a.outputs[0].tokens[0].id < 32000);
        assert_eq!(backend.batches_run(), 2);
    }

    #[test]
    fn test_synthetic_eos() {
        let backend = SyntheticBackend::new(SyntheticConfig {
            eos_after: Some(2),
            ..SyntheticConfig::default()
        });
        let batch = Batch::new(
            1,
            BatchPhase::Decode,
            vec![entry(1, vec![1], 1), entry(2, vec![1, 2, 3], 2)],
        );
        let out = backend.run_batch(&batch).unwrap();
        assert!(!out.get(SequenceId::new(1)).unwrap().tokens[0].is_eos);
        assert!(out.get(SequenceId::new(2)).unwrap().tokens[0].is_eos);
    }

    #[test]
    fn test_synthetic_failure() {
        let backend = SyntheticBackend::default();
        backend.set_failing(true);
        let batch = Batch::new(3, BatchPhase::Prefill, vec![entry(1, vec![1], 0)]);
        assert!(matches!(backend.run_batch(&batch), Err(Error::Backend(_))));
    }

    #[test]
    fn test_draft_agrees_with_target() {
        let config = SyntheticConfig::default();
        let draft = SyntheticDraft::new(config.clone(), 0);
        let target = SyntheticBackend::new(config);
        let proposed = draft.propose(&[4, 5], 3, 1.0).unwrap();
        let ids: Vec<_> = proposed.iter().map(|t| t.id).collect();
        let scores = target.score(&[4, 5], &ids).unwrap();
        assert_eq!(scores.len(), 4);
        for (t, s) in proposed.iter().zip(&scores) {
            assert_eq!(t.id, s.best);
        }
    }

    #[test]
    fn test_top_candidates() {
        let draft = SyntheticDraft::new(SyntheticConfig::default(), 0);
        let candidates = draft.top_candidates(&[1], 3).unwrap();
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].logprob > candidates[2].logprob);
    }
}
