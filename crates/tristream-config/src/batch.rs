//! Continuous batching and KV cache configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// KV cache eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently updated slot first
    #[default]
    Lru,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
        }
    }
}

/// Continuous batcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct BatchConfig {
    /// Hard upper bound on sequences per batch.
    #[serde(default = "default_max_batch_size")]
    #[validate(range(min = 1))]
    pub max_batch_size: usize,

    /// Batch size at which a batch is formed without waiting.
    #[serde(default = "default_preferred_batch_size")]
    #[validate(range(min = 1))]
    pub preferred_batch_size: usize,

    /// Upper bound on prompt tokens per prefill batch.
    #[serde(default = "default_max_tokens_per_batch")]
    #[validate(range(min = 1))]
    pub max_tokens_per_batch: usize,

    /// Longest a pending sequence waits before being forced into a batch.
    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,

    /// Maximum sequences per prefill batch.
    #[serde(default = "default_prefill_batch_size")]
    #[validate(range(min = 1))]
    pub prefill_batch_size: usize,

    /// Maximum sequences per decode batch.
    #[serde(default = "default_decode_batch_size")]
    #[validate(range(min = 1))]
    pub decode_batch_size: usize,

    /// Capacity of the submission queue.
    #[serde(default = "default_submit_queue_capacity")]
    #[validate(range(min = 1))]
    pub submit_queue_capacity: usize,

    /// Order pending sequences by stream priority.
    #[serde(default = "default_true")]
    pub enable_priority: bool,

    /// Priority per stream, indexed by stream id.
    #[serde(default = "default_stream_priorities")]
    pub stream_priorities: [u32; 3],

    /// Total KV cache capacity in tokens.
    #[serde(default = "default_max_kv_cache_tokens")]
    #[validate(range(min = 1))]
    pub max_kv_cache_tokens: usize,

    /// KV cache eviction policy.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            preferred_batch_size: default_preferred_batch_size(),
            max_tokens_per_batch: default_max_tokens_per_batch(),
            max_wait_time_ms: default_max_wait_time_ms(),
            prefill_batch_size: default_prefill_batch_size(),
            decode_batch_size: default_decode_batch_size(),
            submit_queue_capacity: default_submit_queue_capacity(),
            enable_priority: true,
            stream_priorities: default_stream_priorities(),
            max_kv_cache_tokens: default_max_kv_cache_tokens(),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl BatchConfig {
    /// Maximum wait time as a duration.
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    /// Scheduler tick period: half the maximum wait, at least 1ms.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis((self.max_wait_time_ms / 2).max(1))
    }

    /// Number of KV cache slots.
    pub fn kv_slots(&self) -> usize {
        self.max_batch_size * 2
    }

    /// Degenerate configuration that runs one sequence per step.
    pub fn unbatched(mut self) -> Self {
        self.max_batch_size = 1;
        self.preferred_batch_size = 1;
        self.prefill_batch_size = 1;
        self.decode_batch_size = 1;
        self.max_wait_time_ms = 0;
        self
    }
}

fn default_max_batch_size() -> usize {
    64
}

fn default_preferred_batch_size() -> usize {
    8
}

fn default_max_tokens_per_batch() -> usize {
    8192
}

fn default_max_wait_time_ms() -> u64 {
    50
}

fn default_prefill_batch_size() -> usize {
    32
}

fn default_decode_batch_size() -> usize {
    64
}

fn default_submit_queue_capacity() -> usize {
    1000
}

fn default_stream_priorities() -> [u32; 3] {
    [3, 2, 1]
}

fn default_max_kv_cache_tokens() -> usize {
    32768
}

fn default_true() -> bool {
    true
}
