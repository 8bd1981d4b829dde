//! Speculative decoding.
//!
//! A cheap draft model proposes a short continuation; the target model
//! scores every drafted position in one pass. Drafted tokens are accepted
//! left to right until the first rejection, where the target's own token is
//! emitted instead. If everything is accepted the target's bonus token for
//! the next position is emitted too, so each round yields at least one
//! token.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use validator::Validate;

use tristream_config::{AcceptanceMethod, SpeculativeConfig};
use tristream_core::{Error, Result, StreamId, TokenId, NUM_STREAMS};

use crate::backend::{BatchOutput, ComputeBackend, GeneratedToken, SequenceOutput};
use crate::batch::{Batch, BatchPhase};

/// EMA smoothing factor for acceptance rates.
pub const ACCEPT_RATE_ALPHA: f64 = 0.1;

/// A token with its log probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredToken {
    /// Token id
    pub id: TokenId,
    /// Log probability
    pub logprob: f32,
}

impl ScoredToken {
    /// Create a scored token.
    pub fn new(id: TokenId, logprob: f32) -> Self {
        Self { id, logprob }
    }
}

/// Target model verdict for one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetScore {
    /// Target log probability of the drafted token at this position
    pub logprob: f32,
    /// Target's preferred token
    pub best: TokenId,
    /// Log probability of `best`
    pub best_logprob: f32,
}

/// Cheap model that proposes continuations.
pub trait DraftModel: Send + Sync {
    /// Propose up to `n` tokens continuing `context`.
    fn propose(&self, context: &[TokenId], n: usize, temperature: f32) -> Result<Vec<ScoredToken>>;

    /// The `k` most likely next tokens, best first.
    fn top_candidates(&self, context: &[TokenId], k: usize) -> Result<Vec<ScoredToken>>;
}

/// Model whose distribution the output must follow.
pub trait TargetModel: Send + Sync {
    /// Score `draft` as a continuation of `context`.
    ///
    /// Returns one entry per drafted position plus, optionally, one bonus
    /// entry for the position after the last drafted token.
    fn score(&self, context: &[TokenId], draft: &[TokenId]) -> Result<Vec<TargetScore>>;
}

/// Whether a drafted token survives verification.
pub fn accepts(config: &SpeculativeConfig, target_logprob: f32, draft_logprob: f32) -> bool {
    match config.acceptance_method {
        AcceptanceMethod::Greedy => target_logprob >= draft_logprob,
        AcceptanceMethod::Typical => target_logprob - draft_logprob >= config.typical_p.ln(),
        AcceptanceMethod::Nucleus => target_logprob.exp() >= config.nucleus_p,
    }
}

/// Outcome of one drafting round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftSequence {
    /// Stream the round ran on
    pub stream: Option<StreamId>,
    /// Drafted tokens
    pub tokens: Vec<ScoredToken>,
    /// Drafted tokens that survived
    pub accepted: usize,
    /// Drafted tokens discarded
    pub rejected: usize,
}

impl DraftSequence {
    /// Drafted length.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether nothing was drafted.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Accepted fraction of this round.
    pub fn acceptance_rate(&self) -> f64 {
        if self.tokens.is_empty() {
            0.0
        } else {
            self.accepted as f64 / self.tokens.len() as f64
        }
    }
}

/// Tokens produced by one speculative round.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeculativeOutput {
    /// Emitted tokens, in order
    pub tokens: Vec<ScoredToken>,
    /// The draft and its verdict
    pub draft: DraftSequence,
    /// Whether the last token is a correction for a rejected draft
    pub corrected: bool,
    /// Whether the last token is the bonus after a fully accepted draft
    pub bonus: bool,
}

/// Per-stream counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSpeculativeStats {
    /// Rounds run
    pub iterations: u64,
    /// Tokens drafted
    pub drafted: u64,
    /// Drafted tokens accepted
    pub accepted: u64,
    /// Drafted tokens rejected
    pub rejected: u64,
    /// Bonus tokens emitted
    pub bonus: u64,
    /// Smoothed acceptance rate
    pub acceptance_rate: f64,
    /// Current draft length
    pub draft_length: usize,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeculativeStats {
    /// Rounds run
    pub iterations: u64,
    /// Tokens drafted
    pub drafted: u64,
    /// Drafted tokens accepted
    pub accepted: u64,
    /// Drafted tokens rejected
    pub rejected: u64,
    /// Bonus tokens emitted
    pub bonus: u64,
    /// Per stream, indexed by stream id
    pub streams: [StreamSpeculativeStats; NUM_STREAMS],
}

impl SpeculativeStats {
    /// Lifetime acceptance rate.
    pub fn acceptance_rate(&self) -> f64 {
        if self.drafted == 0 {
            0.0
        } else {
            self.accepted as f64 / self.drafted as f64
        }
    }
}

#[derive(Debug)]
struct StreamState {
    stats: StreamSpeculativeStats,
    seeded: bool,
}

/// Speculative decoding engine.
pub struct SpeculativeEngine {
    config: SpeculativeConfig,
    draft: Arc<dyn DraftModel>,
    target: Arc<dyn TargetModel>,
    streams: [Mutex<StreamState>; NUM_STREAMS],
}

impl SpeculativeEngine {
    /// Create an engine. Fails if `config` is invalid.
    pub fn new(
        config: SpeculativeConfig,
        draft: Arc<dyn DraftModel>,
        target: Arc<dyn TargetModel>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::config(tristream_config::ConfigError::from(e).to_string()))?;
        let streams = StreamId::ALL.map(|stream| {
            let initial = config.stream_draft_tokens[stream.index()]
                .clamp(1, config.max_draft_tokens);
            Mutex::new(StreamState {
                stats: StreamSpeculativeStats {
                    draft_length: initial,
                    ..StreamSpeculativeStats::default()
                },
                seeded: false,
            })
        });
        Ok(Self {
            config,
            draft,
            target,
            streams,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &SpeculativeConfig {
        &self.config
    }

    /// Current draft length for `stream`.
    pub fn draft_length(&self, stream: StreamId) -> usize {
        self.streams[stream.index()].lock().stats.draft_length
    }

    /// Draft model.
    pub fn draft_model(&self) -> &Arc<dyn DraftModel> {
        &self.draft
    }

    /// Target model.
    pub fn target_model(&self) -> &Arc<dyn TargetModel> {
        &self.target
    }

    /// Run one round for `stream`, emitting at most `max_tokens` tokens.
    pub fn step(
        &self,
        stream: StreamId,
        context: &[TokenId],
        max_tokens: usize,
    ) -> Result<SpeculativeOutput> {
        if max_tokens == 0 {
            return Err(Error::Speculative("no tokens left to generate".into()));
        }
        let n = self.draft_length(stream).min(max_tokens);

        let mut drafted = self.draft.propose(context, n, self.config.temperature)?;
        drafted.truncate(n);
        let ids: Vec<TokenId> = drafted.iter().map(|t| t.id).collect();
        let scores = self.target.score(context, &ids)?;
        if scores.len() < drafted.len() {
            return Err(Error::Speculative(format!(
                "target scored {} of {} drafted positions",
                scores.len(),
                drafted.len()
            )));
        }

        let output = self.verify(stream, drafted, &scores, max_tokens)?;
        self.record(stream, &output);
        Ok(output)
    }

    fn verify(
        &self,
        stream: StreamId,
        drafted: Vec<ScoredToken>,
        scores: &[TargetScore],
        max_tokens: usize,
    ) -> Result<SpeculativeOutput> {
        let mut tokens = Vec::with_capacity(drafted.len() + 1);
        let mut accepted = 0;
        let mut corrected = false;

        for (draft, score) in drafted.iter().zip(scores) {
            if accepts(&self.config, score.logprob, draft.logprob) {
                tokens.push(ScoredToken::new(draft.id, score.logprob));
                accepted += 1;
            } else {
                tokens.push(ScoredToken::new(score.best, score.best_logprob));
                corrected = true;
                break;
            }
        }

        let mut bonus = false;
        if !corrected && tokens.len() < max_tokens {
            if let Some(score) = scores.get(drafted.len()) {
                tokens.push(ScoredToken::new(score.best, score.best_logprob));
                bonus = true;
            }
        }

        if tokens.is_empty() {
            return Err(Error::Speculative(
                "target produced no token for an empty draft".into(),
            ));
        }

        let rejected = drafted.len() - accepted;
        trace!(
            "Speculative round on {}: drafted={} accepted={} emitted={}",
            stream,
            drafted.len(),
            accepted,
            tokens.len()
        );
        Ok(SpeculativeOutput {
            tokens,
            draft: DraftSequence {
                stream: Some(stream),
                tokens: drafted,
                accepted,
                rejected,
            },
            corrected,
            bonus,
        })
    }

    fn record(&self, stream: StreamId, output: &SpeculativeOutput) {
        let draft = &output.draft;
        tristream_metrics::add_speculative_tokens("accepted", draft.accepted as u64);
        tristream_metrics::add_speculative_tokens("rejected", draft.rejected as u64);
        if output.bonus {
            tristream_metrics::add_speculative_tokens("bonus", 1);
        }

        let mut state = self.streams[stream.index()].lock();
        let stats = &mut state.stats;
        stats.iterations += 1;
        stats.drafted += draft.len() as u64;
        stats.accepted += draft.accepted as u64;
        stats.rejected += draft.rejected as u64;
        stats.bonus += output.bonus as u64;

        if draft.is_empty() {
            return;
        }
        let rate = draft.acceptance_rate();
        if state.seeded {
            state.stats.acceptance_rate =
                ACCEPT_RATE_ALPHA * rate + (1.0 - ACCEPT_RATE_ALPHA) * state.stats.acceptance_rate;
        } else {
            state.stats.acceptance_rate = rate;
            state.seeded = true;
        }

        if self.config.adaptive_draft {
            let ema = state.stats.acceptance_rate;
            let length = state.stats.draft_length;
            if ema < self.config.min_accept_rate as f64 && length > 1 {
                state.stats.draft_length = length - 1;
                debug!("Shrinking draft length on {} to {}", stream, length - 1);
            } else if ema > self.config.max_accept_rate as f64
                && length < self.config.max_draft_tokens
            {
                state.stats.draft_length = length + 1;
                debug!("Growing draft length on {} to {}", stream, length + 1);
            }
        }
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SpeculativeStats {
        let streams = StreamId::ALL.map(|s| self.streams[s.index()].lock().stats.clone());
        SpeculativeStats {
            iterations: streams.iter().map(|s| s.iterations).sum(),
            drafted: streams.iter().map(|s| s.drafted).sum(),
            accepted: streams.iter().map(|s| s.accepted).sum(),
            rejected: streams.iter().map(|s| s.rejected).sum(),
            bonus: streams.iter().map(|s| s.bonus).sum(),
            streams,
        }
    }

    /// Restore a stream's draft length, e.g. after recovery.
    pub fn set_draft_length(&self, stream: StreamId, length: usize) {
        self.streams[stream.index()].lock().stats.draft_length =
            length.clamp(1, self.config.max_draft_tokens);
    }

    /// Zero the counters, keeping draft lengths.
    pub fn reset_stats(&self) {
        for slot in &self.streams {
            let mut state = slot.lock();
            let length = state.stats.draft_length;
            state.stats = StreamSpeculativeStats {
                draft_length: length,
                ..StreamSpeculativeStats::default()
            };
            state.seeded = false;
        }
    }
}

impl fmt::Debug for SpeculativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeculativeEngine")
            .field("config", &self.config)
            .finish()
    }
}

/// Compute backend that decodes speculatively.
///
/// Prefill batches go straight to the inner backend; decode batches run one
/// speculative round per sequence, in parallel.
pub struct SpeculativeBackend {
    inner: Arc<dyn ComputeBackend>,
    engine: Arc<SpeculativeEngine>,
}

impl SpeculativeBackend {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn ComputeBackend>, engine: Arc<SpeculativeEngine>) -> Self {
        Self { inner, engine }
    }

    /// The speculative engine.
    pub fn engine(&self) -> &Arc<SpeculativeEngine> {
        &self.engine
    }
}

impl ComputeBackend for SpeculativeBackend {
    fn name(&self) -> &str {
        "speculative"
    }

    fn run_batch(&self, batch: &Batch) -> Result<BatchOutput> {
        if batch.phase() == BatchPhase::Prefill {
            return self.inner.run_batch(batch);
        }

        let eos = self.inner.eos_token();
        let outputs = batch
            .entries()
            .par_iter()
            .map(|entry| {
                let round = self
                    .engine
                    .step(entry.stream, &entry.context, entry.remaining.max(1))?;
                let mut tokens = Vec::with_capacity(round.tokens.len());
                for t in round.tokens {
                    let is_eos = eos == Some(t.id);
                    tokens.push(GeneratedToken {
                        id: t.id,
                        logprob: t.logprob,
                        text: self.inner.token_text(t.id),
                        is_eos,
                    });
                    if is_eos {
                        break;
                    }
                }
                Ok(SequenceOutput {
                    sequence: entry.sequence,
                    tokens,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(BatchOutput {
            batch_id: batch.id(),
            outputs,
        })
    }

    fn token_text(&self, id: TokenId) -> String {
        self.inner.token_text(id)
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.inner.eos_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticConfig, SyntheticDraft};
    use crate::batch::BatchEntry;
    use tristream_core::SequenceId;

    fn engine(config: SpeculativeConfig, miss_every: usize) -> SpeculativeEngine {
        let synthetic = SyntheticConfig::default();
        SpeculativeEngine::new(
            config,
            Arc::new(SyntheticDraft::new(synthetic.clone(), miss_every)),
            Arc::new(SyntheticBackend::new(synthetic)),
        )
        .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = SpeculativeConfig::default();
        assert_eq!(config.draft_tokens, 4);
        assert!(config.acceptance_method == "typical");
    }

    #[test]
    fn test_stats_zero_before_run() {
        let engine = engine(SpeculativeConfig::default(), 0);
        let stats = engine.stats();
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.acceptance_rate(), 0.0);
    }

    #[test]
    fn test_acceptance_rules() {
        let mut config = SpeculativeConfig::default();
        config.acceptance_method = AcceptanceMethod::Greedy;
        assert!(accepts(&config, -0.5, -0.5));
        assert!(!accepts(&config, -0.6, -0.5));

        config.acceptance_method = AcceptanceMethod::Typical;
        assert!(accepts(&config, -0.55, -0.5));
        assert!(!accepts(&config, -1.0, -0.5));

        config.acceptance_method = AcceptanceMethod::Nucleus;
        assert!(accepts(&config, -0.01, -3.0));
        assert!(!accepts(&config, -0.2, -0.01));
    }

    #[test]
    fn test_full_accept_emits_bonus() {
        let engine = engine(SpeculativeConfig::default(), 0);
        let out = engine.step(StreamId::Alpha, &[1, 2, 3], 16).unwrap();
        assert_eq!(out.draft.len(), 4);
        assert_eq!(out.draft.accepted, 4);
        assert!(out.bonus);
        assert_eq!(out.tokens.len(), 5);
        assert_eq!(out.draft.accepted + out.draft.rejected, out.draft.len());
    }

    #[test]
    fn test_rejection_emits_correction() {
        // Every second drafted position disagrees with the target.
        let engine = engine(SpeculativeConfig::default(), 2);
        let out = engine.step(StreamId::Beta, &[7], 16).unwrap();
        assert_eq!(out.draft.accepted, 1);
        assert_eq!(out.draft.rejected, 3);
        assert!(out.corrected);
        assert!(!out.bonus);
        assert_eq!(out.tokens.len(), 2);
    }

    #[test]
    fn test_always_progresses() {
        let engine = engine(SpeculativeConfig::default(), 1);
        let out = engine.step(StreamId::Gamma, &[5, 5], 16).unwrap();
        assert_eq!(out.draft.accepted, 0);
        assert_eq!(out.tokens.len(), 1);
    }

    #[test]
    fn test_respects_max_tokens() {
        let engine = engine(SpeculativeConfig::default(), 0);
        let out = engine.step(StreamId::Alpha, &[1], 2).unwrap();
        assert_eq!(out.draft.len(), 2);
        assert_eq!(out.tokens.len(), 2);
        assert!(!out.bonus);
        assert!(engine.step(StreamId::Alpha, &[1], 0).is_err());
    }

    #[test]
    fn test_draft_length_shrinks_on_rejection() {
        let engine = engine(SpeculativeConfig::default(), 1);
        assert_eq!(engine.draft_length(StreamId::Alpha), 4);
        for i in 0..10 {
            engine.step(StreamId::Alpha, &[i], 16).unwrap();
        }
        assert_eq!(engine.draft_length(StreamId::Alpha), 1);
        assert_eq!(engine.draft_length(StreamId::Beta), 4);
    }

    #[test]
    fn test_draft_length_grows_on_acceptance() {
        let engine = engine(SpeculativeConfig::default(), 0);
        for i in 0..10 {
            engine.step(StreamId::Beta, &[i], 64).unwrap();
        }
        assert_eq!(engine.draft_length(StreamId::Beta), 8);

        let stats = engine.stats();
        assert_eq!(stats.iterations, 10);
        assert_eq!(stats.streams[1].iterations, 10);
        assert_eq!(stats.rejected, 0);
        assert!((stats.streams[1].acceptance_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset_stats_keeps_length() {
        let engine = engine(SpeculativeConfig::default(), 0);
        engine.step(StreamId::Alpha, &[1], 64).unwrap();
        let length = engine.draft_length(StreamId::Alpha);
        engine.reset_stats();
        assert_eq!(engine.stats().iterations, 0);
        assert_eq!(engine.draft_length(StreamId::Alpha), length);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SpeculativeConfig {
            draft_tokens: 10,
            max_draft_tokens: 4,
            ..SpeculativeConfig::default()
        };
        let synthetic = SyntheticConfig::default();
        let result = SpeculativeEngine::new(
            config,
            Arc::new(SyntheticDraft::new(synthetic.clone(), 0)),
            Arc::new(SyntheticBackend::new(synthetic)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_backend_decodes_multiple_tokens() {
        let synthetic = SyntheticConfig::default();
        let inner: Arc<dyn ComputeBackend> = Arc::new(SyntheticBackend::new(synthetic.clone()));
        let engine = Arc::new(
            SpeculativeEngine::new(
                SpeculativeConfig::default(),
                Arc::new(SyntheticDraft::new(synthetic, 0)),
                Arc::new(SyntheticBackend::new(SyntheticConfig::default())),
            )
            .unwrap(),
        );
        let backend = SpeculativeBackend::new(inner, engine);

        let entry = BatchEntry {
            sequence: SequenceId::new(1),
            stream: StreamId::Alpha,
            context: vec![1, 2],
            input_len: 1,
            generated: 1,
            remaining: 10,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
        };
        let batch = Batch::new(1, BatchPhase::Decode, vec![entry]);
        let output = backend.run_batch(&batch).unwrap();
        assert_eq!(output.outputs.len(), 1);
        assert_eq!(output.outputs[0].tokens.len(), 5);
    }
}
