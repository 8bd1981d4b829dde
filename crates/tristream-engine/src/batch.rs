//! Batches handed to the compute backend.
//!
//! Membership is fixed at construction; the batcher builds a new batch for
//! every step.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use tristream_core::{SequenceId, StreamId, TokenId};

use crate::sequence::Sequence;

/// Batch phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    /// Whole prompts, first token out.
    Prefill,
    /// One step for sequences already generating.
    Decode,
}

impl BatchPhase {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Prefill => "prefill",
            BatchPhase::Decode => "decode",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sequence's input for a step.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// Sequence id
    pub sequence: SequenceId,
    /// Stream id
    pub stream: StreamId,
    /// Prompt plus tokens generated so far
    pub context: Vec<TokenId>,
    /// Tokens of `context` that are new this step
    pub input_len: usize,
    /// Tokens generated before this step
    pub generated: usize,
    /// Tokens the sequence may still generate
    pub remaining: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus parameter
    pub top_p: f32,
    /// Top-k parameter
    pub top_k: u32,
}

impl BatchEntry {
    /// Snapshot `sequence` for `phase`.
    pub fn from_sequence(sequence: &Sequence, phase: BatchPhase) -> Self {
        let input_len = match phase {
            BatchPhase::Prefill => sequence.prompt_len(),
            BatchPhase::Decode => 1,
        };
        Self {
            sequence: sequence.id(),
            stream: sequence.stream(),
            context: sequence.context(),
            input_len,
            generated: sequence.generated_len(),
            remaining: sequence.remaining(),
            temperature: sequence.temperature(),
            top_p: sequence.top_p(),
            top_k: sequence.top_k(),
        }
    }

    /// Position of the next generated token.
    pub fn position(&self) -> usize {
        self.context.len()
    }

    /// Last token of the context.
    pub fn last_token(&self) -> Option<TokenId> {
        self.context.last().copied()
    }
}

/// A set of sequences executed together.
#[derive(Debug, Clone)]
pub struct Batch {
    id: u64,
    phase: BatchPhase,
    entries: Vec<BatchEntry>,
    created_at: Instant,
}

impl Batch {
    /// Create a batch.
    pub fn new(id: u64, phase: BatchPhase, entries: Vec<BatchEntry>) -> Self {
        Self {
            id,
            phase,
            entries,
            created_at: Instant::now(),
        }
    }

    /// Batch id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Phase.
    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    /// Whether this is a prefill batch.
    pub fn is_prefill(&self) -> bool {
        self.phase == BatchPhase::Prefill
    }

    /// Member entries.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch has no sequences.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of new input tokens.
    pub fn total_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.input_len).sum()
    }

    /// Member sequence ids.
    pub fn sequence_ids(&self) -> impl Iterator<Item = SequenceId> + '_ {
        self.entries.iter().map(|e| e.sequence)
    }

    /// Whether `sequence` is a member.
    pub fn contains(&self, sequence: SequenceId) -> bool {
        self.entries.iter().any(|e| e.sequence == sequence)
    }

    /// When the batch was formed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tristream_core::InferenceRequest;

    fn seq(id: u64, prompt: Vec<TokenId>) -> Sequence {
        Sequence::new(
            SequenceId::new(id),
            InferenceRequest::new(StreamId::Beta, prompt, 8),
            2,
        )
    }

    #[test]
    fn test_prefill_entry() {
        let s = seq(1, vec![5, 6, 7]);
        let entry = BatchEntry::from_sequence(&s, BatchPhase::Prefill);
        assert_eq!(entry.input_len, 3);
        assert_eq!(entry.position(), 3);
        assert_eq!(entry.last_token(), Some(7));
        assert_eq!(entry.remaining, 8);
    }

    #[test]
    fn test_decode_entry() {
        let mut s = seq(1, vec![5]);
        s.push_token(9, 0.0, "x");
        let entry = BatchEntry::from_sequence(&s, BatchPhase::Decode);
        assert_eq!(entry.input_len, 1);
        assert_eq!(entry.context, vec![5, 9]);
        assert_eq!(entry.remaining, 7);
    }

    #[test]
    fn test_batch_membership() {
        let entries = vec![
            BatchEntry::from_sequence(&seq(1, vec![1, 2]), BatchPhase::Prefill),
            BatchEntry::from_sequence(&seq(2, vec![3, 4, 5]), BatchPhase::Prefill),
        ];
        let batch = Batch::new(7, BatchPhase::Prefill, entries);
        assert_eq!(batch.id(), 7);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.total_tokens(), 5);
        assert!(batch.contains(SequenceId::new(2)));
        assert!(!batch.contains(SequenceId::new(3)));
        assert_eq!(
            batch.sequence_ids().collect::<Vec<_>>(),
            vec![SequenceId::new(1), SequenceId::new(2)]
        );
        assert_eq!(batch.phase().to_string(), "prefill");
    }
}
