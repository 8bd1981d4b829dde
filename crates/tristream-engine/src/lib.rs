//! # Tristream Engine
//!
//! Inference serving engine for three independent token streams, with
//! per-stream memory pools, continuous batching over an LRU-managed KV
//! cache, and speculative decoding.
//!
//! ## Architecture
//!
//! - **Memory pools**: arena allocation per stream, no cross-stream locking
//! - **Streaming**: bounded token streams, response accumulation, multiplexing
//! - **KV cache**: fixed slots, token-capacity accounting, LRU eviction
//! - **Batcher**: prefill/decode batch formation on a background task
//! - **Speculative**: draft-and-verify decoding, chain and tree shaped
//! - **Engine**: lifecycle, metrics, health and state persistence
//!
//! ## Example
//!
//! ```rust,ignore
//! use tristream_engine::prelude::*;
//!
//! let engine = ProductionEngine::new(ProductionConfig::default())?;
//! engine.initialize().await?;
//! engine.start()?;
//!
//! let handle = engine
//!     .submit(InferenceRequest::new(StreamId::Alpha, vec![1, 2, 3], 16))
//!     .await?;
//! let response = handle.wait().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod allocator;
pub mod backend;
pub mod batch;
pub mod batcher;
pub mod engine;
pub mod kv_cache;
pub mod memory_pool;
pub mod sequence;
pub mod speculative;
pub mod streaming;
pub mod tree;

pub use allocator::{Shape, StreamAllocator, TensorAllocator, TensorId, TensorMeta};
pub use backend::{
    BatchOutput, ComputeBackend, GeneratedToken, SequenceOutput, SyntheticBackend,
    SyntheticConfig, SyntheticDraft,
};
pub use batch::{Batch, BatchEntry, BatchPhase};
pub use batcher::{BatcherStats, ContinuousBatcher, SequenceHandle};
pub use engine::{
    ComponentHealth, EngineStatus, Health, ProductionEngine, ProductionEngineBuilder,
    ProductionMetrics, StreamMetrics,
};
pub use kv_cache::{KvCacheManager, KvCacheStats, SlotHandle};
pub use memory_pool::{BufferHandle, MemoryPool, PoolStats, TypedHandle};
pub use sequence::{Sequence, SequenceState};
pub use speculative::{
    DraftModel, DraftSequence, ScoredToken, SpeculativeBackend, SpeculativeEngine,
    SpeculativeOutput, SpeculativeStats, StreamSpeculativeStats, TargetModel, TargetScore,
};
pub use streaming::{
    ConsumeOutcome, StreamConsumer, StreamMultiplexer, StreamingResponse, TokenStream,
    DEFAULT_STREAM_CAPACITY,
};
pub use tree::{SpeculativeTree, TreeNode, TreeSpeculator, TreeStats, TreeVerification};

/// Prelude for common imports
pub mod prelude {
    pub use super::engine::{ProductionEngine, ProductionEngineBuilder};
    pub use super::batcher::SequenceHandle;
    pub use super::streaming::{StreamingResponse, TokenStream};
    pub use tristream_config::ProductionConfig;
    pub use tristream_core::{FinishReason, InferenceRequest, InferenceResponse, StreamId};
}
