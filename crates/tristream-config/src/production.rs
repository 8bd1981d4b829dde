//! Top-level engine configuration and its builder-style options.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::batch::BatchConfig;
use crate::engine::EngineParams;
use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::speculative::SpeculativeConfig;
use crate::state::StateConfig;
use crate::{LoggingConfig, MetricsConfig};

/// Configuration for the production engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProductionConfig {
    /// Target model location, passed through to the backend.
    #[serde(default)]
    pub model_path: String,

    /// Draft model location; presence enables speculative decoding.
    #[serde(default)]
    pub draft_model_path: Option<String>,

    /// Backend execution parameters.
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineParams,

    /// Continuous batching.
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchConfig,

    /// Speculative decoding.
    #[serde(default)]
    #[validate(nested)]
    pub speculative: SpeculativeConfig,

    /// State persistence.
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,

    /// Per-stream memory pools.
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolConfig,

    /// Number of inference streams; fixed at three.
    #[serde(default = "default_num_streams")]
    #[validate(range(min = 3, max = 3))]
    pub num_streams: usize,

    /// Run on GPU devices.
    #[serde(default)]
    pub enable_gpu: bool,

    /// Device ordinals passed through to the backend.
    #[serde(default = "default_gpu_devices")]
    pub gpu_devices: Vec<u32>,

    /// Expose per-token streams to callers.
    #[serde(default = "default_true")]
    pub enable_streaming: bool,

    /// Batch sequences together.
    #[serde(default = "default_true")]
    pub enable_batching: bool,

    /// Use draft-and-verify decoding.
    #[serde(default)]
    pub enable_speculative: bool,

    /// Snapshot engine state to disk.
    #[serde(default = "default_true")]
    pub enable_state_persistence: bool,

    /// Use per-stream memory pools.
    #[serde(default = "default_true")]
    pub enable_memory_pool: bool,

    /// Token stream buffer capacity.
    #[serde(default = "default_stream_capacity")]
    #[validate(range(min = 1))]
    pub stream_capacity: usize,

    /// Logging.
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,

    /// Metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            draft_model_path: None,
            engine: EngineParams::default(),
            batch: BatchConfig::default(),
            speculative: SpeculativeConfig::default(),
            state: StateConfig::default(),
            pool: PoolConfig::default(),
            num_streams: default_num_streams(),
            enable_gpu: false,
            gpu_devices: default_gpu_devices(),
            enable_streaming: true,
            enable_batching: true,
            enable_speculative: false,
            enable_state_persistence: true,
            enable_memory_pool: true,
            stream_capacity: default_stream_capacity(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl ProductionConfig {
    /// Defaults for the given model.
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Self::default()
        }
    }

    /// Set the context window.
    pub fn with_context_size(mut self, tokens: usize) -> Self {
        self.engine.context_size = tokens;
        self
    }

    /// Set the backend batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.engine.batch_size = size;
        self
    }

    /// Use a draft model; enables speculative decoding.
    pub fn with_draft_model(mut self, path: impl Into<String>) -> Self {
        self.draft_model_path = Some(path.into());
        self.enable_speculative = true;
        self
    }

    /// Run on the given GPU devices.
    pub fn with_gpu(mut self, devices: impl IntoIterator<Item = u32>) -> Self {
        self.enable_gpu = true;
        self.gpu_devices = devices.into_iter().collect();
        self
    }

    /// Store snapshots under `dir`.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.storage_dir = dir.into();
        self
    }

    /// Snapshot every `interval`.
    pub fn with_auto_save(mut self, interval: Duration) -> Self {
        self.state.auto_save_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Run each sequence in its own step.
    pub fn without_batching(mut self) -> Self {
        self.enable_batching = false;
        self
    }

    /// Deliver only completed responses.
    pub fn without_streaming(mut self) -> Self {
        self.enable_streaming = false;
        self
    }

    /// Disable snapshots.
    pub fn without_persistence(mut self) -> Self {
        self.enable_state_persistence = false;
        self
    }

    /// Replace the batching section.
    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Replace the pool section.
    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the speculative section.
    pub fn with_speculative_config(mut self, speculative: SpeculativeConfig) -> Self {
        self.speculative = speculative;
        self
    }

    /// Batching configuration in effect, accounting for `enable_batching`.
    pub fn effective_batch_config(&self) -> BatchConfig {
        if self.enable_batching {
            self.batch.clone()
        } else {
            self.batch.clone().unbatched()
        }
    }

    /// Validate field ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        <Self as Validate>::validate(self).map_err(ConfigError::from)?;
        crate::validation::validate_config(self)
    }
}

fn default_num_streams() -> usize {
    3
}

fn default_gpu_devices() -> Vec<u32> {
    vec![0]
}

fn default_stream_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}
