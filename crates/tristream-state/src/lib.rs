//! # Tristream State
//!
//! Durable engine state: a versioned binary snapshot format with optional
//! gzip payloads, a snapshot/checkpoint manager with retention, delta-based
//! incremental updates and raw KV-cache slot dumps.

pub mod error;
pub mod format;
pub mod incremental;
pub mod kv_store;
pub mod manager;
pub mod state;

pub use error::{Result, StateError};
pub use format::{
    read_binary_state, read_binary_state_with_header, read_header, write_binary_state,
    write_binary_state_with_flags, write_binary_state_with_options, StateHeader, FLAG_CHECKPOINT,
    FLAG_COMPRESSED, MAGIC,
};
pub use incremental::{DeltaRecord, IncrementalStateManager, StateDelta};
pub use kv_store::KvSlotStore;
pub use manager::{SnapshotInfo, StateManager, INDEX_FILE};
pub use state::{
    BatcherSnapshot, CognitiveState, KvCacheSnapshot, MemoryPoolSnapshot, MetricsSnapshot,
    SpeculativeSnapshot, StreamState, FORMAT_VERSION,
};
