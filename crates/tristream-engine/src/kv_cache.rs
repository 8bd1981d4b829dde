//! KV cache slot accounting with LRU eviction.
//!
//! The manager tracks token reservations, not key/value tensors; those live
//! in the compute backend. Slots are addressed by generation-counted
//! handles so a handle that outlived its slot (released or evicted) is
//! detected instead of aliasing the next occupant.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tristream_config::{BatchConfig, EvictionPolicy};
use tristream_core::{Error, Result, SequenceId};

/// Handle to an occupied KV cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}@{}", self.index, self.generation)
    }
}

/// KV cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvCacheStats {
    /// Tokens currently reserved
    pub used: usize,
    /// Capacity in tokens
    pub capacity: usize,
    /// Total slots
    pub slot_count: usize,
    /// Occupied slots
    pub slots_in_use: usize,
    /// Successful allocations
    pub allocations: u64,
    /// Explicit releases
    pub releases: u64,
    /// Slots evicted to make room
    pub evictions: u64,
    /// Requests rejected with `CapacityExceeded`
    pub rejections: u64,
}

impl KvCacheStats {
    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used as f64 / self.capacity as f64
        }
    }
}

#[derive(Debug)]
struct Occupant {
    sequence: SequenceId,
    tokens: usize,
    last_tick: u64,
    active: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupant: Option<Occupant>,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<u32>,
    used: usize,
    tick: u64,
    evicted: VecDeque<SequenceId>,
    stats: KvCacheStats,
}

impl Inner {
    fn occupant(&self, handle: SlotHandle) -> Option<&Occupant> {
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.occupant.as_ref())
    }

    fn occupant_mut(&mut self, handle: SlotHandle) -> Result<&mut Occupant> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or_else(|| Error::invalid_state(format!("unknown KV slot {}", handle)))?;
        if slot.generation != handle.generation {
            return Err(Error::StaleHandle {
                handle: handle.generation as u64,
                current: slot.generation as u64,
            });
        }
        slot.occupant
            .as_mut()
            .ok_or_else(|| Error::invalid_state(format!("KV slot {} is empty", handle)))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Pick LRU victims that free `tokens_needed` tokens (and one slot if
    /// `slot_needed`). Returns `None` if the inactive slots cannot cover it.
    fn plan_eviction(
        &self,
        tokens_needed: usize,
        slot_needed: bool,
        exclude: Option<u32>,
    ) -> Option<Vec<u32>> {
        let mut candidates: Vec<(u64, SequenceId, u32, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx as u32) != exclude)
            .filter_map(|(idx, slot)| {
                slot.occupant
                    .as_ref()
                    .filter(|o| !o.active)
                    .map(|o| (o.last_tick, o.sequence, idx as u32, o.tokens))
            })
            .collect();
        candidates.sort_by_key(|&(tick, seq, _, _)| (tick, seq));

        let mut freed = 0usize;
        let mut victims = Vec::new();
        for (_, _, idx, tokens) in candidates {
            if freed >= tokens_needed && (!slot_needed || !victims.is_empty()) {
                break;
            }
            freed += tokens;
            victims.push(idx);
        }

        let satisfied = freed >= tokens_needed && (!slot_needed || !victims.is_empty());
        satisfied.then_some(victims)
    }

    fn vacate(&mut self, index: u32) -> Option<Occupant> {
        let slot = &mut self.slots[index as usize];
        let occupant = slot.occupant.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used -= occupant.tokens;
        self.free.push(index);
        self.stats.slots_in_use -= 1;
        Some(occupant)
    }

    fn evict(&mut self, victims: Vec<u32>) {
        for idx in victims {
            if let Some(occupant) = self.vacate(idx) {
                debug!(
                    "Evicted {} from KV slot {} ({} tokens)",
                    occupant.sequence, idx, occupant.tokens
                );
                self.stats.evictions += 1;
                self.evicted.push_back(occupant.sequence);
                tristream_metrics::inc_evictions(1);
            }
        }
    }

    fn reject(&mut self, requested: usize) -> Error {
        self.stats.rejections += 1;
        Error::CapacityExceeded {
            requested,
            capacity: self.capacity,
        }
    }
}

/// KV cache manager.
///
/// All operations are non-blocking: when capacity runs out the manager
/// evicts inactive slots in (last update, sequence id) order, or fails with
/// [`Error::CapacityExceeded`] without evicting anything.
pub struct KvCacheManager {
    policy: EvictionPolicy,
    inner: Mutex<Inner>,
}

impl KvCacheManager {
    /// Create a manager with `capacity` tokens spread over `slot_count` slots.
    pub fn new(capacity: usize, slot_count: usize, policy: EvictionPolicy) -> Self {
        let slot_count = slot_count.max(1);
        Self {
            policy,
            inner: Mutex::new(Inner {
                capacity,
                slots: (0..slot_count).map(|_| Slot::default()).collect(),
                free: (0..slot_count as u32).rev().collect(),
                used: 0,
                tick: 0,
                evicted: VecDeque::new(),
                stats: KvCacheStats {
                    capacity,
                    slot_count,
                    ..KvCacheStats::default()
                },
            }),
        }
    }

    /// Create a manager sized from the batch configuration.
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(
            config.max_kv_cache_tokens,
            config.kv_slots(),
            config.eviction_policy,
        )
    }

    /// Eviction policy in use.
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Reserve `token_estimate` tokens for `sequence`.
    ///
    /// The new slot starts active (pinned) so it cannot be evicted before
    /// its first step; call [`unpin`](Self::unpin) once the step is done.
    pub fn allocate(&self, sequence: SequenceId, token_estimate: usize) -> Result<SlotHandle> {
        let mut inner = self.inner.lock();
        if token_estimate > inner.capacity {
            return Err(inner.reject(token_estimate));
        }

        let tokens_needed = (inner.used + token_estimate).saturating_sub(inner.capacity);
        let slot_needed = inner.free.is_empty();
        if tokens_needed > 0 || slot_needed {
            match inner.plan_eviction(tokens_needed, slot_needed, None) {
                Some(victims) => inner.evict(victims),
                None => {
                    warn!(
                        "KV cache cannot fit {} tokens for {} ({} / {} used)",
                        token_estimate, sequence, inner.used, inner.capacity
                    );
                    return Err(inner.reject(token_estimate));
                }
            }
        }

        let index = inner
            .free
            .pop()
            .ok_or_else(|| Error::invalid_state("KV slot free list empty after eviction"))?;
        let tick = inner.next_tick();
        let slot = &mut inner.slots[index as usize];
        slot.occupant = Some(Occupant {
            sequence,
            tokens: token_estimate,
            last_tick: tick,
            active: true,
        });
        let handle = SlotHandle {
            index,
            generation: slot.generation,
        };
        inner.used += token_estimate;
        inner.stats.allocations += 1;
        inner.stats.slots_in_use += 1;
        debug!("Allocated {} for {} ({} tokens)", handle, sequence, token_estimate);
        Ok(handle)
    }

    /// Grow the reservation of `slot` to `new_token_count` tokens.
    ///
    /// Shrinking is ignored. Growth may evict other inactive slots.
    pub fn update(&self, slot: SlotHandle, new_token_count: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let current = inner.occupant_mut(slot)?.tokens;
        let tick = inner.next_tick();

        if new_token_count > current {
            let delta = new_token_count - current;
            if new_token_count > inner.capacity {
                return Err(inner.reject(new_token_count));
            }
            let tokens_needed = (inner.used + delta).saturating_sub(inner.capacity);
            if tokens_needed > 0 {
                match inner.plan_eviction(tokens_needed, false, Some(slot.index)) {
                    Some(victims) => inner.evict(victims),
                    None => return Err(inner.reject(delta)),
                }
            }
            inner.used += delta;
        }

        let occupant = inner.occupant_mut(slot)?;
        occupant.tokens = occupant.tokens.max(new_token_count);
        occupant.last_tick = tick;
        Ok(())
    }

    /// Release `slot`. Returns `false` if it was already released or evicted.
    pub fn release(&self, slot: SlotHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.occupant(slot).is_none() {
            return false;
        }
        match inner.vacate(slot.index) {
            Some(occupant) => {
                inner.stats.releases += 1;
                debug!("Released {} held by {}", slot, occupant.sequence);
                true
            }
            None => false,
        }
    }

    /// Mark `slot` as part of a running step; active slots are never evicted.
    pub fn pin(&self, slot: SlotHandle) -> bool {
        self.set_active(slot, true)
    }

    /// Make `slot` evictable again.
    pub fn unpin(&self, slot: SlotHandle) -> bool {
        self.set_active(slot, false)
    }

    fn set_active(&self, slot: SlotHandle, active: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.occupant_mut(slot) {
            Ok(occupant) => {
                occupant.active = active;
                true
            }
            Err(_) => false,
        }
    }

    /// Whether `slot` still refers to a live reservation.
    pub fn is_live(&self, slot: SlotHandle) -> bool {
        self.inner.lock().occupant(slot).is_some()
    }

    /// Tokens reserved by `slot`, if live.
    pub fn tokens(&self, slot: SlotHandle) -> Option<usize> {
        self.inner.lock().occupant(slot).map(|o| o.tokens)
    }

    /// Sequence holding `slot`, if live.
    pub fn sequence(&self, slot: SlotHandle) -> Option<SequenceId> {
        self.inner.lock().occupant(slot).map(|o| o.sequence)
    }

    /// Drain the sequences evicted since the last call.
    pub fn take_evicted(&self) -> Vec<SequenceId> {
        self.inner.lock().evicted.drain(..).collect()
    }

    /// Used tokens.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    /// Capacity in tokens.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Current statistics.
    pub fn stats(&self) -> KvCacheStats {
        let inner = self.inner.lock();
        KvCacheStats {
            used: inner.used,
            ..inner.stats.clone()
        }
    }
}

impl fmt::Debug for KvCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("KvCacheManager")
            .field("policy", &self.policy)
            .field("used", &stats.used)
            .field("capacity", &stats.capacity)
            .field("slots_in_use", &stats.slots_in_use)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(capacity: usize, slots: usize) -> KvCacheManager {
        KvCacheManager::new(capacity, slots, EvictionPolicy::Lru)
    }

    #[test]
    fn test_allocate_release() {
        let kv = manager(1000, 4);
        let slot = kv.allocate(SequenceId::new(1), 100).unwrap();
        let before = kv.used();
        assert_eq!(before, 100);

        assert!(kv.release(slot));
        assert!(kv.used() < before);
        assert!(!kv.release(slot));
    }

    #[test]
    fn test_update_grows() {
        let kv = manager(1000, 4);
        let slot = kv.allocate(SequenceId::new(1), 100).unwrap();
        let before = kv.used();
        kv.update(slot, 150).unwrap();
        assert!(kv.used() >= before + 50);
        assert_eq!(kv.tokens(slot), Some(150));

        kv.update(slot, 120).unwrap();
        assert_eq!(kv.tokens(slot), Some(150));
    }

    #[test]
    fn test_capacity_exceeded_without_candidates() {
        let kv = manager(200, 4);
        let _a = kv.allocate(SequenceId::new(1), 150).unwrap();
        let err = kv.allocate(SequenceId::new(2), 100).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
        assert_eq!(kv.used(), 150);
        assert_eq!(kv.stats().rejections, 1);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let kv = manager(100, 4);
        assert!(matches!(
            kv.allocate(SequenceId::new(1), 101),
            Err(Error::CapacityExceeded { requested: 101, capacity: 100 })
        ));
    }

    #[test]
    fn test_lru_eviction_order() {
        let kv = manager(300, 8);
        let a = kv.allocate(SequenceId::new(1), 100).unwrap();
        let b = kv.allocate(SequenceId::new(2), 100).unwrap();
        let c = kv.allocate(SequenceId::new(3), 100).unwrap();
        for slot in [a, b, c] {
            kv.unpin(slot);
        }
        // Touch a so b becomes least recently updated.
        kv.update(a, 100).unwrap();

        let d = kv.allocate(SequenceId::new(4), 100).unwrap();
        assert!(kv.is_live(a));
        assert!(!kv.is_live(b));
        assert!(kv.is_live(c));
        assert!(kv.is_live(d));
        assert_eq!(kv.take_evicted(), vec![SequenceId::new(2)]);
        assert!(kv.take_evicted().is_empty());
        assert!(kv.used() <= kv.capacity());
    }

    #[test]
    fn test_tie_break_lowest_sequence() {
        let kv = manager(200, 2);
        let high = kv.allocate(SequenceId::new(9), 100).unwrap();
        let low = kv.allocate(SequenceId::new(3), 100).unwrap();
        {
            let mut inner = kv.inner.lock();
            for slot in inner.slots.iter_mut() {
                if let Some(o) = slot.occupant.as_mut() {
                    o.last_tick = 7;
                    o.active = false;
                }
            }
        }
        kv.allocate(SequenceId::new(10), 100).unwrap();
        assert!(kv.is_live(high));
        assert!(!kv.is_live(low));
    }

    #[test]
    fn test_active_slots_not_evicted() {
        let kv = manager(200, 4);
        let a = kv.allocate(SequenceId::new(1), 100).unwrap();
        let b = kv.allocate(SequenceId::new(2), 100).unwrap();
        assert!(kv.allocate(SequenceId::new(3), 100).is_err());

        kv.unpin(b);
        kv.allocate(SequenceId::new(3), 100).unwrap();
        assert!(kv.is_live(a));
        assert!(!kv.is_live(b));
    }

    #[test]
    fn test_no_partial_eviction_on_failure() {
        let kv = manager(300, 4);
        let a = kv.allocate(SequenceId::new(1), 100).unwrap();
        let _b = kv.allocate(SequenceId::new(2), 200).unwrap();
        kv.unpin(a);

        // Evicting a alone frees 100 tokens, not enough for 250.
        assert!(kv.allocate(SequenceId::new(3), 250).is_err());
        assert!(kv.is_live(a));
        assert_eq!(kv.stats().evictions, 0);
    }

    #[test]
    fn test_slot_exhaustion_evicts() {
        let kv = manager(10_000, 2);
        let a = kv.allocate(SequenceId::new(1), 10).unwrap();
        let b = kv.allocate(SequenceId::new(2), 10).unwrap();
        kv.unpin(a);
        kv.unpin(b);
        let c = kv.allocate(SequenceId::new(3), 10).unwrap();
        assert!(!kv.is_live(a));
        assert!(kv.is_live(c));
        assert_eq!(kv.stats().slots_in_use, 2);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let kv = manager(1000, 1);
        let a = kv.allocate(SequenceId::new(1), 10).unwrap();
        assert!(kv.release(a));
        let b = kv.allocate(SequenceId::new(2), 10).unwrap();
        assert_eq!(a.index(), b.index());

        assert!(!kv.release(a));
        assert!(matches!(kv.update(a, 20), Err(Error::StaleHandle { .. })));
        assert_eq!(kv.sequence(b), Some(SequenceId::new(2)));
    }

    #[test]
    fn test_stats() {
        let config = BatchConfig {
            max_batch_size: 4,
            max_kv_cache_tokens: 512,
            ..BatchConfig::default()
        };
        let kv = KvCacheManager::from_config(&config);
        kv.allocate(SequenceId::new(1), 64).unwrap();
        let stats = kv.stats();
        assert_eq!(stats.used, 64);
        assert_eq!(stats.capacity, 512);
        assert_eq!(stats.slot_count, 8);
        assert_eq!(stats.allocations, 1);
        assert!((stats.utilization() - 0.125).abs() < 1e-9);
    }
}
