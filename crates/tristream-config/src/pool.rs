//! Memory pool configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// One mebibyte.
pub const MIB: usize = 1024 * 1024;

/// Arena-backed memory pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PoolConfig {
    /// Size of each arena in bytes.
    #[serde(default = "default_arena_size")]
    #[validate(range(min = 1024))]
    pub arena_size: usize,

    /// Maximum number of arenas a pool may hold.
    #[serde(default = "default_max_arenas")]
    #[validate(range(min = 1))]
    pub max_arenas: usize,

    /// Arenas reserved up front.
    #[serde(default = "default_prealloc_arenas")]
    pub prealloc_arenas: usize,

    /// Smallest recycled block size in bytes.
    #[serde(default = "default_min_block_size")]
    pub min_block_size: usize,

    /// Largest recycled block size in bytes.
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,

    /// Allocation alignment in bytes (power of two, at least 8).
    #[serde(default = "default_alignment")]
    #[validate(range(min = 8, max = 4096))]
    pub alignment: usize,

    /// Add arenas when the current ones are full.
    #[serde(default = "default_true")]
    pub grow_on_demand: bool,

    /// Zero recycled blocks before handing them out again.
    #[serde(default)]
    pub zero_on_alloc: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            arena_size: default_arena_size(),
            max_arenas: default_max_arenas(),
            prealloc_arenas: default_prealloc_arenas(),
            min_block_size: default_min_block_size(),
            max_block_size: default_max_block_size(),
            alignment: default_alignment(),
            grow_on_demand: true,
            zero_on_alloc: false,
        }
    }
}

impl PoolConfig {
    /// Small pool for tests and examples.
    pub fn small(arena_size: usize, max_arenas: usize) -> Self {
        Self {
            arena_size,
            max_arenas,
            prealloc_arenas: 1,
            ..Self::default()
        }
    }

    /// Upper bound on bytes a pool can hand out.
    pub fn max_capacity(&self) -> usize {
        self.arena_size.saturating_mul(self.max_arenas)
    }
}

fn default_arena_size() -> usize {
    256 * MIB
}

fn default_max_arenas() -> usize {
    16
}

fn default_prealloc_arenas() -> usize {
    2
}

fn default_min_block_size() -> usize {
    64
}

fn default_max_block_size() -> usize {
    64 * MIB
}

fn default_alignment() -> usize {
    64
}

fn default_true() -> bool {
    true
}
