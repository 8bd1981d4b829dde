//! State persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Which snapshot to restore on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Newest snapshot of any kind
    #[default]
    Latest,
    /// Newest checkpoint only
    Checkpoint,
    /// Start fresh
    None,
}

/// State persistence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct StateConfig {
    /// Directory holding snapshot files and the index.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Regular snapshots retained; checkpoints are never pruned.
    #[serde(default = "default_max_snapshots")]
    #[validate(range(min = 1))]
    pub max_snapshots: usize,

    /// Auto-save period in milliseconds, 0 disables.
    #[serde(default)]
    pub auto_save_interval_ms: u64,

    /// Checkpoint period in milliseconds, 0 disables.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,

    /// Snapshot restored on startup.
    #[serde(default)]
    pub recovery_mode: RecoveryMode,

    /// Gzip snapshot payloads.
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Gzip level, 1 (fast) to 9 (small).
    #[serde(default = "default_compression_level")]
    #[validate(range(min = 1, max = 9))]
    pub compression_level: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_snapshots: default_max_snapshots(),
            auto_save_interval_ms: 0,
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            recovery_mode: RecoveryMode::Latest,
            compression: default_compression(),
            compression_level: default_compression_level(),
        }
    }
}

impl StateConfig {
    /// Config rooted at `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Auto-save period, if enabled.
    pub fn auto_save_interval(&self) -> Option<Duration> {
        (self.auto_save_interval_ms > 0).then(|| Duration::from_millis(self.auto_save_interval_ms))
    }

    /// Gzip level to write snapshots with, if compression is on.
    pub fn effective_compression_level(&self) -> Option<u32> {
        self.compression.then_some(self.compression_level)
    }

    /// Checkpoint period, if enabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0)
            .then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./tristream_state")
}

fn default_max_snapshots() -> usize {
    10
}

fn default_checkpoint_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_compression() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}
