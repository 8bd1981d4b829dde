//! Serializable engine state.
//!
//! Plain data only: the engine fills a [`CognitiveState`] from its
//! components and restores from one after recovery.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use tristream_core::NUM_STREAMS;

use crate::error::Result;

/// Format version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Per-stream progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    /// Caller step counter last seen
    pub step: u64,
    /// Tokens generated
    pub tokens_generated: u64,
    /// Requests completed
    pub requests: u64,
    /// Requests submitted
    pub submitted: u64,
    /// Mean latency of completed requests
    pub avg_latency_ms: f64,
    /// Speculative draft length
    pub draft_length: usize,
}

/// KV cache accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvCacheSnapshot {
    /// Tokens reserved
    pub used: usize,
    /// Capacity in tokens
    pub capacity: usize,
    /// Slots
    pub slot_count: usize,
    /// Lifetime evictions
    pub evictions: u64,
}

/// Batcher counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatcherSnapshot {
    /// Sequences submitted
    pub sequence_count: u64,
    /// Batches executed
    pub batch_count: u64,
    /// Sequences completed
    pub completed: u64,
    /// Sequences cancelled or evicted
    pub cancelled: u64,
    /// No-op completions
    pub noop_completions: u64,
    /// Failed batch steps
    pub failed_batches: u64,
}

/// Memory pool counters for one stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPoolSnapshot {
    /// Bytes ever allocated
    pub total_allocated: u64,
    /// Bytes in use
    pub current_usage: u64,
    /// High-water mark
    pub peak_usage: u64,
    /// Arenas reserved
    pub arena_count: usize,
    /// Resets performed
    pub reset_count: u64,
}

/// Speculative decoding counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeculativeSnapshot {
    /// Whether speculative decoding was on
    pub enabled: bool,
    /// Rounds run
    pub iterations: u64,
    /// Drafted tokens accepted
    pub accepted: u64,
    /// Drafted tokens rejected
    pub rejected: u64,
    /// Lifetime acceptance rate
    pub acceptance_rate: f64,
}

/// Engine request metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Requests submitted
    pub total_requests: u64,
    /// Requests finished successfully
    pub successful_requests: u64,
    /// Requests that failed
    pub failed_requests: u64,
    /// Requests cancelled
    pub cancelled_requests: u64,
    /// Tokens generated
    pub total_tokens: u64,
    /// Prompt tokens processed
    pub total_prompt_tokens: u64,
    /// Fastest request
    pub min_latency_ms: u64,
    /// Slowest request
    pub max_latency_ms: u64,
    /// Mean latency
    pub avg_latency_ms: f64,
    /// Engine uptime
    pub uptime_ms: u64,
}

/// Full engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognitiveState {
    /// Format version
    pub version: u32,
    /// When the state was captured
    pub timestamp: DateTime<Utc>,
    /// Free-text description
    pub description: String,
    /// Hex SHA-256 over the state with this field empty
    pub checksum: String,
    /// Per-stream progress, indexed by stream id
    pub streams: [StreamState; NUM_STREAMS],
    /// KV cache accounting
    pub kv_cache: KvCacheSnapshot,
    /// Batcher counters
    pub batcher: BatcherSnapshot,
    /// Memory pools, indexed by stream id
    pub memory: [MemoryPoolSnapshot; NUM_STREAMS],
    /// Speculative decoding counters
    pub speculative: SpeculativeSnapshot,
    /// Request metrics
    pub metrics: MetricsSnapshot,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl Default for CognitiveState {
    fn default() -> Self {
        Self::new("")
    }
}

impl CognitiveState {
    /// Empty state stamped now.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            timestamp: Utc::now(),
            description: description.into(),
            checksum: String::new(),
            streams: Default::default(),
            kv_cache: KvCacheSnapshot::default(),
            batcher: BatcherSnapshot::default(),
            memory: Default::default(),
            speculative: SpeculativeSnapshot::default(),
            metrics: MetricsSnapshot::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// Checksum of the state content.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.checksum.clear();
        let bytes = bincode::serialize(&unsealed)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Store the current checksum.
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Whether the stored checksum matches the content.
    pub fn verify_checksum(&self) -> Result<bool> {
        Ok(!self.checksum.is_empty() && self.checksum == self.compute_checksum()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let state = CognitiveState::new("boot");
        assert_eq!(state.version, FORMAT_VERSION);
        assert_eq!(state.description, "boot");
        assert_eq!(state.streams.len(), NUM_STREAMS);
        assert!(state.checksum.is_empty());
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut state = CognitiveState::new("a");
        state.seal().unwrap();
        assert!(state.verify_checksum().unwrap());
        assert_eq!(state.checksum.len(), 64);

        state.streams[1].step = 42;
        assert!(!state.verify_checksum().unwrap());
        state.seal().unwrap();
        assert!(state.verify_checksum().unwrap());
    }
}
