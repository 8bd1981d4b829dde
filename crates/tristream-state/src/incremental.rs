//! Delta-based state updates.
//!
//! Frequent small changes are recorded as typed [`StateDelta`]s against a
//! base state instead of re-serializing the whole state each time.
//! [`IncrementalStateManager::compact`] folds the log into a new base.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tristream_core::StreamId;

use crate::error::Result;
use crate::state::{
    BatcherSnapshot, CognitiveState, KvCacheSnapshot, MemoryPoolSnapshot, MetricsSnapshot,
    SpeculativeSnapshot,
};

/// One field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateDelta {
    /// Set a stream's step counter.
    StreamStep { stream: StreamId, step: u64 },
    /// Set a stream's generated token count.
    StreamTokens { stream: StreamId, tokens_generated: u64 },
    /// Set a stream's completed request count.
    StreamRequests { stream: StreamId, requests: u64 },
    /// Set a stream's draft length.
    DraftLength { stream: StreamId, length: usize },
    /// Replace KV cache accounting.
    KvCache(KvCacheSnapshot),
    /// Replace batcher counters.
    Batcher(BatcherSnapshot),
    /// Replace a stream's memory pool counters.
    Memory {
        stream: StreamId,
        snapshot: MemoryPoolSnapshot,
    },
    /// Replace speculative counters.
    Speculative(SpeculativeSnapshot),
    /// Replace request metrics.
    Metrics(MetricsSnapshot),
    /// Set the description.
    Description(String),
    /// Set (`Some`) or remove (`None`) a metadata key.
    Metadata { key: String, value: Option<String> },
}

impl StateDelta {
    /// Dotted path of the field this delta writes.
    pub fn field_path(&self) -> String {
        match self {
            StateDelta::StreamStep { stream, .. } => format!("streams.{}.step", stream),
            StateDelta::StreamTokens { stream, .. } => {
                format!("streams.{}.tokens_generated", stream)
            }
            StateDelta::StreamRequests { stream, .. } => format!("streams.{}.requests", stream),
            StateDelta::DraftLength { stream, .. } => format!("streams.{}.draft_length", stream),
            StateDelta::KvCache(_) => "kv_cache".into(),
            StateDelta::Batcher(_) => "batcher".into(),
            StateDelta::Memory { stream, .. } => format!("memory.{}", stream),
            StateDelta::Speculative(_) => "speculative".into(),
            StateDelta::Metrics(_) => "metrics".into(),
            StateDelta::Description(_) => "description".into(),
            StateDelta::Metadata { key, .. } => format!("metadata.{}", key),
        }
    }

    /// Write this delta into `state`.
    pub fn apply(&self, state: &mut CognitiveState) {
        match self {
            StateDelta::StreamStep { stream, step } => state.streams[stream.index()].step = *step,
            StateDelta::StreamTokens {
                stream,
                tokens_generated,
            } => state.streams[stream.index()].tokens_generated = *tokens_generated,
            StateDelta::StreamRequests { stream, requests } => {
                state.streams[stream.index()].requests = *requests
            }
            StateDelta::DraftLength { stream, length } => {
                state.streams[stream.index()].draft_length = *length
            }
            StateDelta::KvCache(kv) => state.kv_cache = kv.clone(),
            StateDelta::Batcher(b) => state.batcher = b.clone(),
            StateDelta::Memory { stream, snapshot } => {
                state.memory[stream.index()] = snapshot.clone()
            }
            StateDelta::Speculative(s) => state.speculative = s.clone(),
            StateDelta::Metrics(m) => state.metrics = m.clone(),
            StateDelta::Description(d) => state.description = d.clone(),
            StateDelta::Metadata { key, value } => match value {
                Some(v) => {
                    state.metadata.insert(key.clone(), v.clone());
                }
                None => {
                    state.metadata.remove(key);
                }
            },
        }
    }
}

/// A recorded delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    /// Record order, breaks timestamp ties
    pub seq: u64,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// The change
    pub delta: StateDelta,
}

struct Inner {
    base: CognitiveState,
    deltas: Vec<DeltaRecord>,
    next_seq: u64,
}

/// Base state plus an ordered log of deltas.
pub struct IncrementalStateManager {
    inner: RwLock<Inner>,
}

impl IncrementalStateManager {
    /// Start from `base`.
    pub fn new(base: CognitiveState) -> Self {
        Self {
            inner: RwLock::new(Inner {
                base,
                deltas: Vec::new(),
                next_seq: 0,
            }),
        }
    }

    /// Current base state.
    pub fn base(&self) -> CognitiveState {
        self.inner.read().base.clone()
    }

    /// Pending deltas.
    pub fn delta_count(&self) -> usize {
        self.inner.read().deltas.len()
    }

    /// Recorded deltas in record order.
    pub fn deltas(&self) -> Vec<DeltaRecord> {
        self.inner.read().deltas.clone()
    }

    /// Record a delta stamped now.
    pub fn record_delta(&self, delta: StateDelta) -> u64 {
        self.record_delta_at(delta, Utc::now())
    }

    /// Record a delta with an explicit timestamp.
    pub fn record_delta_at(&self, delta: StateDelta, timestamp: DateTime<Utc>) -> u64 {
        let mut inner = self.inner.write();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.deltas.push(DeltaRecord {
            seq,
            timestamp,
            delta,
        });
        seq
    }

    /// Base with every delta replayed in (timestamp, record order).
    ///
    /// The base is left untouched. The result's timestamp is the later of
    /// the base timestamp and the newest delta, and its checksum is fresh.
    pub fn apply_deltas(&self) -> Result<CognitiveState> {
        let inner = self.inner.read();
        materialize(&inner.base, &inner.deltas)
    }

    /// Fold the log into a new base and clear it. Returns the new base.
    pub fn compact(&self) -> Result<CognitiveState> {
        let mut inner = self.inner.write();
        let folded = materialize(&inner.base, &inner.deltas)?;
        debug!("Compacted {} deltas", inner.deltas.len());
        inner.base = folded.clone();
        inner.deltas.clear();
        Ok(folded)
    }

    /// Replace the base and drop pending deltas.
    pub fn reset(&self, base: CognitiveState) {
        let mut inner = self.inner.write();
        inner.base = base;
        inner.deltas.clear();
    }
}

fn materialize(base: &CognitiveState, deltas: &[DeltaRecord]) -> Result<CognitiveState> {
    let mut order: Vec<&DeltaRecord> = deltas.iter().collect();
    order.sort_by_key(|r| (r.timestamp, r.seq));

    let mut state = base.clone();
    for record in &order {
        record.delta.apply(&mut state);
    }
    if let Some(last) = order.last() {
        state.timestamp = state.timestamp.max(last.timestamp);
    }
    state.seal()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base() -> CognitiveState {
        let mut state = CognitiveState::new("base");
        state.seal().unwrap();
        state
    }

    #[test]
    fn test_apply_leaves_base_untouched() {
        let base = base();
        let mgr = IncrementalStateManager::new(base.clone());
        mgr.record_delta(StateDelta::StreamStep {
            stream: StreamId::Beta,
            step: 5,
        });
        let applied = mgr.apply_deltas().unwrap();
        assert_eq!(applied.streams[1].step, 5);
        assert_eq!(mgr.base(), base);
        assert_eq!(mgr.delta_count(), 1);
        assert!(applied.verify_checksum().unwrap());
    }

    #[test]
    fn test_timestamp_order() {
        let mgr = IncrementalStateManager::new(base());
        let t0 = Utc::now();
        // Recorded out of order; the later timestamp must win.
        mgr.record_delta_at(StateDelta::Description("late".into()), t0 + Duration::seconds(2));
        mgr.record_delta_at(StateDelta::Description("early".into()), t0 + Duration::seconds(1));
        let applied = mgr.apply_deltas().unwrap();
        assert_eq!(applied.description, "late");
        assert_eq!(applied.timestamp, t0 + Duration::seconds(2));
    }

    #[test]
    fn test_equal_timestamps_use_record_order() {
        let mgr = IncrementalStateManager::new(base());
        let t = Utc::now();
        mgr.record_delta_at(StateDelta::Description("first".into()), t);
        mgr.record_delta_at(StateDelta::Description("second".into()), t);
        assert_eq!(mgr.apply_deltas().unwrap().description, "second");
    }

    #[test]
    fn test_metadata_set_and_remove() {
        let mgr = IncrementalStateManager::new(base());
        let t = Utc::now();
        mgr.record_delta_at(
            StateDelta::Metadata {
                key: "k".into(),
                value: Some("v".into()),
            },
            t,
        );
        assert_eq!(mgr.apply_deltas().unwrap().metadata["k"], "v");
        mgr.record_delta_at(
            StateDelta::Metadata {
                key: "k".into(),
                value: None,
            },
            t + Duration::milliseconds(1),
        );
        assert!(mgr.apply_deltas().unwrap().metadata.is_empty());
    }

    #[test]
    fn test_compact_is_idempotent() {
        let mgr = IncrementalStateManager::new(base());
        let t = Utc::now();
        mgr.record_delta_at(
            StateDelta::KvCache(KvCacheSnapshot {
                used: 10,
                capacity: 100,
                slot_count: 4,
                evictions: 1,
            }),
            t,
        );
        mgr.record_delta_at(
            StateDelta::DraftLength {
                stream: StreamId::Gamma,
                length: 6,
            },
            t + Duration::milliseconds(5),
        );

        let before = mgr.apply_deltas().unwrap();
        let compacted = mgr.compact().unwrap();
        assert_eq!(compacted, before);
        assert_eq!(mgr.delta_count(), 0);
        assert_eq!(mgr.apply_deltas().unwrap(), before);
        assert!(compacted.verify_checksum().unwrap());
    }

    #[test]
    fn test_field_paths() {
        let delta = StateDelta::StreamTokens {
            stream: StreamId::Alpha,
            tokens_generated: 1,
        };
        assert_eq!(delta.field_path(), "streams.alpha.tokens_generated");
        assert_eq!(
            StateDelta::Metadata {
                key: "x".into(),
                value: None
            }
            .field_path(),
            "metadata.x"
        );
    }
}
