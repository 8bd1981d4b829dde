//! Arena-backed memory pool for per-step inference buffers.
//!
//! Allocation bumps an offset inside one of a bounded set of arenas;
//! `reset` rewinds every arena without returning memory to the OS.
//! Buffers are addressed through generation-counted handles instead of
//! pointers, so a handle that outlives a `reset` is rejected with
//! [`Error::StaleHandle`] rather than aliasing reused memory.
//!
//! Arenas are backed by `u64` words so that every aligned offset is at
//! least 8-byte aligned, which lets [`bytemuck`] hand out typed `f32`/`i32`
//! views without any unsafe code.

use std::collections::HashMap;
use std::marker::PhantomData;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tristream_config::PoolConfig;
use tristream_core::{Error, Result};

const WORD: usize = std::mem::size_of::<u64>();

/// Handle to a raw byte buffer inside a [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    arena: u32,
    offset: usize,
    len: usize,
    capacity: usize,
    generation: u64,
}

impl BufferHandle {
    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes reserved after alignment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pool generation this handle was issued in.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Handle to a typed buffer inside a [`MemoryPool`].
#[derive(Debug)]
pub struct TypedHandle<T> {
    raw: BufferHandle,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for TypedHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedHandle<T> {}

impl<T> TypedHandle<T> {
    /// Number of elements.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Underlying byte handle.
    pub fn raw(&self) -> BufferHandle {
        self.raw
    }
}

/// Pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Bytes handed out since creation
    pub total_allocated: u64,
    /// Bytes returned through `free`
    pub total_freed: u64,
    /// Bytes currently outstanding
    pub current_usage: u64,
    /// High-water mark of `current_usage`
    pub peak_usage: u64,
    /// Arenas created
    pub arena_count: usize,
    /// Successful allocations
    pub allocation_count: u64,
    /// Successful frees
    pub free_count: u64,
    /// Allocations that failed for lack of space
    pub oom_count: u64,
    /// Bytes reserved across all arenas
    pub reserved_bytes: u64,
    /// Times the pool was reset
    pub reset_count: u64,
}

impl PoolStats {
    /// Fraction of reserved bytes in use.
    pub fn utilization(&self) -> f64 {
        if self.reserved_bytes == 0 {
            0.0
        } else {
            self.current_usage as f64 / self.reserved_bytes as f64
        }
    }
}

/// One contiguous region, materialized on first use.
struct Arena {
    words: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl Arena {
    fn new(capacity: usize) -> Self {
        Self {
            words: Vec::new(),
            capacity,
            used: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    fn bump(&mut self, size: usize) -> Option<usize> {
        if size > self.remaining() {
            return None;
        }
        if self.words.is_empty() {
            self.words = vec![0u64; self.capacity / WORD];
        }
        let offset = self.used;
        self.used += size;
        Some(offset)
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

/// Arena allocator for one inference stream.
pub struct MemoryPool {
    config: PoolConfig,
    arena_size: usize,
    arenas: Vec<Arena>,
    /// Recycled blocks keyed by aligned size.
    free_lists: HashMap<usize, Vec<(u32, usize)>>,
    /// Outstanding blocks: (arena, offset) -> capacity.
    live: HashMap<(u32, usize), usize>,
    generation: u64,
    closed: bool,
    stats: PoolStats,
}

impl MemoryPool {
    /// Create a pool, reserving `prealloc_arenas` arenas.
    pub fn new(config: PoolConfig) -> Self {
        let alignment = config.alignment.max(WORD).next_power_of_two();
        let arena_size = round_up(config.arena_size.max(WORD), alignment)
            .unwrap_or(usize::MAX & !(alignment - 1));
        let prealloc = config.prealloc_arenas.min(config.max_arenas);

        let mut pool = Self {
            config: PoolConfig {
                alignment,
                ..config
            },
            arena_size,
            arenas: Vec::with_capacity(prealloc),
            free_lists: HashMap::new(),
            live: HashMap::new(),
            generation: 0,
            closed: false,
            stats: PoolStats::default(),
        };
        for _ in 0..prealloc {
            pool.push_arena();
        }
        debug!(
            "Initialized memory pool: arena_size={}, max_arenas={}, prealloc={}",
            arena_size, pool.config.max_arenas, prealloc
        );
        pool
    }

    fn push_arena(&mut self) {
        self.arenas.push(Arena::new(self.arena_size));
        self.stats.arena_count = self.arenas.len();
        self.stats.reserved_bytes = (self.arenas.len() * self.arena_size) as u64;
    }

    /// Pool configuration (alignment normalized).
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current generation; bumped by `reset` and `close`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes that could still be allocated without a reset.
    pub fn available(&self) -> usize {
        let in_arenas: usize = self.arenas.iter().map(Arena::remaining).sum();
        let growable = if self.config.grow_on_demand {
            self.config.max_arenas.saturating_sub(self.arenas.len()) * self.arena_size
        } else {
            0
        };
        in_arenas + growable
    }

    /// Allocate `size` bytes, rounded up to the pool alignment.
    pub fn alloc(&mut self, size: usize) -> Result<BufferHandle> {
        if self.closed {
            return Err(Error::AlreadyClosed("memory pool".to_string()));
        }
        if size == 0 {
            return Err(Error::invalid_state("zero-sized allocation"));
        }

        let aligned = match round_up(size, self.config.alignment) {
            Some(aligned) if aligned <= self.arena_size => aligned,
            _ => return Err(self.out_of_memory(size)),
        };
        let (arena, offset) = match self.take_recycled(aligned) {
            Some(slot) => slot,
            None => self.bump(aligned)?,
        };

        if self.config.zero_on_alloc {
            self.arenas[arena as usize].bytes_mut()[offset..offset + aligned].fill(0);
        }

        self.live.insert((arena, offset), aligned);
        self.stats.total_allocated += aligned as u64;
        self.stats.current_usage += aligned as u64;
        self.stats.peak_usage = self.stats.peak_usage.max(self.stats.current_usage);
        self.stats.allocation_count += 1;

        Ok(BufferHandle {
            arena,
            offset,
            len: size,
            capacity: aligned,
            generation: self.generation,
        })
    }

    fn take_recycled(&mut self, aligned: usize) -> Option<(u32, usize)> {
        self.free_lists.get_mut(&aligned).and_then(Vec::pop)
    }

    fn bump(&mut self, aligned: usize) -> Result<(u32, usize)> {
        if aligned <= self.arena_size {
            for (idx, arena) in self.arenas.iter_mut().enumerate() {
                if let Some(offset) = arena.bump(aligned) {
                    return Ok((idx as u32, offset));
                }
            }

            if self.config.grow_on_demand && self.arenas.len() < self.config.max_arenas {
                self.push_arena();
                let idx = self.arenas.len() - 1;
                debug!("Memory pool grew to {} arenas", self.arenas.len());
                if let Some(offset) = self.arenas[idx].bump(aligned) {
                    return Ok((idx as u32, offset));
                }
            }
        }

        Err(self.out_of_memory(aligned))
    }

    fn out_of_memory(&mut self, requested: usize) -> Error {
        self.stats.oom_count += 1;
        let available = self.available();
        warn!(
            "Memory pool exhausted: requested={}, available={}",
            requested, available
        );
        Error::OutOfMemory {
            requested,
            available,
        }
    }

    /// Allocate `count` elements of `T`.
    pub fn alloc_typed<T: Pod>(&mut self, count: usize) -> Result<TypedHandle<T>> {
        let bytes = match count.checked_mul(std::mem::size_of::<T>()) {
            Some(bytes) => bytes,
            None => return Err(self.out_of_memory(usize::MAX)),
        };
        let raw = self.alloc(bytes)?;
        Ok(TypedHandle {
            raw,
            count,
            _marker: PhantomData,
        })
    }

    /// Allocate `count` `f32` values.
    pub fn alloc_f32(&mut self, count: usize) -> Result<TypedHandle<f32>> {
        self.alloc_typed(count)
    }

    /// Allocate `count` `i32` values.
    pub fn alloc_i32(&mut self, count: usize) -> Result<TypedHandle<i32>> {
        self.alloc_typed(count)
    }

    /// Return a buffer to the pool.
    ///
    /// Blocks within the recycling size range are reused by later
    /// allocations of the same aligned size; others are reclaimed on reset.
    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        self.check(&handle)?;
        let capacity = self
            .live
            .remove(&(handle.arena, handle.offset))
            .unwrap_or(handle.capacity);

        if capacity >= self.config.min_block_size && capacity <= self.config.max_block_size {
            self.free_lists
                .entry(capacity)
                .or_default()
                .push((handle.arena, handle.offset));
        }

        self.stats.current_usage = self.stats.current_usage.saturating_sub(capacity as u64);
        self.stats.total_freed += capacity as u64;
        self.stats.free_count += 1;
        Ok(())
    }

    fn check(&self, handle: &BufferHandle) -> Result<()> {
        if handle.generation != self.generation {
            return Err(Error::StaleHandle {
                handle: handle.generation,
                current: self.generation,
            });
        }
        if !self.live.contains_key(&(handle.arena, handle.offset)) {
            return Err(Error::invalid_state("buffer was already freed"));
        }
        Ok(())
    }

    /// Read access to a buffer.
    pub fn bytes(&self, handle: &BufferHandle) -> Result<&[u8]> {
        self.check(handle)?;
        let arena = &self.arenas[handle.arena as usize];
        Ok(&arena.bytes()[handle.offset..handle.offset + handle.len])
    }

    /// Write access to a buffer.
    pub fn bytes_mut(&mut self, handle: &BufferHandle) -> Result<&mut [u8]> {
        self.check(handle)?;
        let arena = &mut self.arenas[handle.arena as usize];
        Ok(&mut arena.bytes_mut()[handle.offset..handle.offset + handle.len])
    }

    /// Typed read view.
    pub fn slice<T: Pod>(&self, handle: &TypedHandle<T>) -> Result<&[T]> {
        let bytes = self.bytes(&handle.raw)?;
        bytemuck::try_cast_slice(bytes).map_err(|e| Error::invalid_state(e.to_string()))
    }

    /// Typed write view.
    pub fn slice_mut<T: Pod>(&mut self, handle: &TypedHandle<T>) -> Result<&mut [T]> {
        let bytes = self.bytes_mut(&handle.raw)?;
        bytemuck::try_cast_slice_mut(bytes).map_err(|e| Error::invalid_state(e.to_string()))
    }

    /// Usage statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    /// Return every outstanding allocation to the free state.
    ///
    /// Arena memory is kept; all previously issued handles become stale.
    pub fn reset(&mut self) {
        for arena in &mut self.arenas {
            arena.used = 0;
        }
        self.free_lists.clear();
        self.live.clear();
        self.generation += 1;
        self.stats.current_usage = 0;
        self.stats.reset_count += 1;
    }

    /// Release all arena memory. Calling this twice is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed("memory pool".to_string()));
        }
        self.reset();
        self.arenas.clear();
        self.stats.arena_count = 0;
        self.stats.reserved_bytes = 0;
        self.closed = true;
        debug!("Memory pool closed");
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("generation", &self.generation)
            .field("arenas", &self.arenas.len())
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}

/// `None` when rounding would overflow.
fn round_up(size: usize, alignment: usize) -> Option<usize> {
    size.checked_add(alignment - 1).map(|n| n & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> MemoryPool {
        MemoryPool::new(PoolConfig::small(4096, 2))
    }

    #[test]
    fn test_pool_basic() {
        let mut pool = small_pool();
        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(200).unwrap();

        assert_eq!(a.len(), 100);
        assert_eq!(a.capacity(), 128);
        assert_eq!(b.capacity(), 256);

        let stats = pool.stats();
        assert_eq!(stats.current_usage, 384);
        assert_eq!(stats.allocation_count, 2);
        assert!(stats.current_usage <= stats.total_allocated);
    }

    #[test]
    fn test_typed_views() {
        let mut pool = small_pool();
        let floats = pool.alloc_f32(16).unwrap();
        let ints = pool.alloc_i32(8).unwrap();

        pool.slice_mut(&floats).unwrap()[3] = 1.5;
        pool.slice_mut(&ints).unwrap()[7] = -42;

        assert_eq!(pool.slice(&floats).unwrap().len(), 16);
        assert_eq!(pool.slice(&floats).unwrap()[3], 1.5);
        assert_eq!(pool.slice(&ints).unwrap()[7], -42);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = MemoryPool::new(PoolConfig {
            grow_on_demand: false,
            ..PoolConfig::small(1024, 1)
        });
        pool.alloc(1000).unwrap();
        let err = pool.alloc(64).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { .. }));
        assert_eq!(pool.stats().oom_count, 1);
    }

    #[test]
    fn test_pool_grows_to_limit() {
        let mut pool = small_pool();
        pool.alloc(4096).unwrap();
        pool.alloc(4096).unwrap();
        assert_eq!(pool.stats().arena_count, 2);
        assert!(pool.alloc(64).is_err());
    }

    #[test]
    fn test_oversized_allocation() {
        let mut pool = small_pool();
        assert!(matches!(
            pool.alloc(8192),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_huge_allocation_is_out_of_memory() {
        let mut pool = small_pool();
        for size in [usize::MAX, usize::MAX - 10, usize::MAX / 2 + 1] {
            match pool.alloc(size) {
                Err(Error::OutOfMemory { requested, .. }) => assert_eq!(requested, size),
                other => panic!("expected OutOfMemory, got {:?}", other),
            }
        }
        assert_eq!(pool.stats().oom_count, 3);
        assert_eq!(pool.stats().current_usage, 0);
        assert!(pool.alloc(64).is_ok());
    }

    #[test]
    fn test_free_recycles_block() {
        let mut pool = small_pool();
        let a = pool.alloc(256).unwrap();
        pool.free(a).unwrap();
        let b = pool.alloc(256).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.current_usage, 256);
        assert_eq!(stats.total_allocated, 512);
        assert_eq!(b.capacity(), 256);
        assert_eq!(stats.arena_count, 1);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut pool = small_pool();
        let a = pool.alloc(64).unwrap();
        pool.free(a).unwrap();
        assert!(pool.free(a).is_err());
    }

    #[test]
    fn test_reset_invalidates_handles() {
        let mut pool = small_pool();
        let handle = pool.alloc_f32(4).unwrap();
        pool.reset();

        assert_eq!(pool.stats().current_usage, 0);
        assert!(matches!(
            pool.slice(&handle),
            Err(Error::StaleHandle { handle: 0, current: 1 })
        ));

        // Memory is retained for reuse.
        assert_eq!(pool.stats().arena_count, 1);
        pool.alloc(128).unwrap();
    }

    #[test]
    fn test_usage_invariant_under_churn() {
        let mut pool = small_pool();
        let mut handles = Vec::new();
        for i in 1..20 {
            if let Ok(h) = pool.alloc(i * 24) {
                handles.push(h);
            }
            if i % 3 == 0 {
                if let Some(h) = handles.pop() {
                    pool.free(h).unwrap();
                }
            }
            let stats = pool.stats();
            assert!(stats.current_usage <= stats.total_allocated);
        }
        pool.reset();
        assert_eq!(pool.stats().current_usage, 0);
    }

    #[test]
    fn test_close_twice() {
        let mut pool = small_pool();
        pool.alloc(64).unwrap();
        pool.close().unwrap();
        assert!(pool.is_closed());
        assert!(matches!(pool.close(), Err(Error::AlreadyClosed(_))));
        assert!(pool.alloc(64).is_err());
    }

    #[test]
    fn test_zero_on_alloc() {
        let mut pool = MemoryPool::new(PoolConfig {
            zero_on_alloc: true,
            ..PoolConfig::small(4096, 1)
        });
        let a = pool.alloc(64).unwrap();
        pool.bytes_mut(&a).unwrap().fill(0xAB);
        pool.free(a).unwrap();
        let b = pool.alloc(64).unwrap();
        assert!(pool.bytes(&b).unwrap().iter().all(|&x| x == 0));
    }
}
