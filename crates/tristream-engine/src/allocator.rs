//! Per-stream tensor allocation.
//!
//! A [`TensorAllocator`] owns one [`MemoryPool`] and records metadata for
//! every tensor carved out of it. Tensor contents are opaque bytes for the
//! compute backend; nothing here interprets them.
//!
//! [`StreamAllocator`] holds one allocator per stream behind its own lock, so
//! the three streams never contend on shared allocation state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, info};

use tristream_config::PoolConfig;
use tristream_core::{DType, Error, Result, StreamId, NUM_STREAMS};

use crate::memory_pool::{BufferHandle, MemoryPool, PoolStats};

/// Tensor dimensions; most tensors have four or fewer.
pub type Shape = SmallVec<[usize; 4]>;

/// Identifier of a tensor within one allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor-{}", self.0)
    }
}

/// Metadata for an allocated tensor.
#[derive(Debug, Clone)]
pub struct TensorMeta {
    /// Tensor id
    pub id: TensorId,
    /// Caller-supplied name
    pub name: String,
    /// Dimensions
    pub shape: Shape,
    /// Element type
    pub dtype: DType,
    /// Owning stream
    pub stream: StreamId,
    /// Size of the backing buffer in bytes
    pub size_bytes: usize,
    /// When the tensor was allocated
    pub created_at: DateTime<Utc>,
    buffer: BufferHandle,
}

impl TensorMeta {
    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Allocates shaped tensors from a single pool.
#[derive(Debug)]
pub struct TensorAllocator {
    stream: StreamId,
    pool: MemoryPool,
    tensors: BTreeMap<TensorId, TensorMeta>,
    next_id: u64,
}

impl TensorAllocator {
    /// Create an allocator with its own pool.
    pub fn new(stream: StreamId, config: PoolConfig) -> Self {
        Self {
            stream,
            pool: MemoryPool::new(config),
            tensors: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Stream this allocator serves.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Allocate a tensor and record its metadata.
    pub fn alloc_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        stream: StreamId,
    ) -> Result<TensorId> {
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::invalid_state("tensor shape overflows usize"))?;
        let size_bytes = numel
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| Error::invalid_state("tensor size overflows usize"))?;
        if size_bytes == 0 {
            return Err(Error::invalid_state("tensor has a zero-sized dimension"));
        }

        let buffer = self.pool.alloc(size_bytes)?;
        let id = TensorId(self.next_id);
        self.next_id += 1;

        let meta = TensorMeta {
            id,
            name: name.into(),
            shape: Shape::from_slice(shape),
            dtype,
            stream,
            size_bytes,
            created_at: Utc::now(),
            buffer,
        };
        debug!(
            "Allocated {} '{}' {:?} {} on {}",
            id, meta.name, shape, dtype, stream
        );
        self.tensors.insert(id, meta);
        Ok(id)
    }

    /// Metadata for a tensor.
    pub fn tensor_meta(&self, id: TensorId) -> Option<&TensorMeta> {
        self.tensors.get(&id)
    }

    /// Raw bytes of a tensor, for the backend.
    pub fn tensor_bytes(&self, id: TensorId) -> Result<&[u8]> {
        let meta = self
            .tensors
            .get(&id)
            .ok_or_else(|| Error::invalid_state(format!("unknown {}", id)))?;
        self.pool.bytes(&meta.buffer)
    }

    /// Mutable raw bytes of a tensor, for the backend.
    pub fn tensor_bytes_mut(&mut self, id: TensorId) -> Result<&mut [u8]> {
        let buffer = self
            .tensors
            .get(&id)
            .map(|m| m.buffer)
            .ok_or_else(|| Error::invalid_state(format!("unknown {}", id)))?;
        self.pool.bytes_mut(&buffer)
    }

    /// Free one tensor and return its buffer to the pool.
    pub fn free_tensor(&mut self, id: TensorId) -> Result<()> {
        let meta = self
            .tensors
            .remove(&id)
            .ok_or_else(|| Error::invalid_state(format!("unknown {}", id)))?;
        self.pool.free(meta.buffer)
    }

    /// Number of live tensors.
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Tensors recorded for `stream`, in allocation order.
    pub fn tensors_by_stream(&self, stream: StreamId) -> Vec<&TensorMeta> {
        self.tensors
            .values()
            .filter(|meta| meta.stream == stream)
            .collect()
    }

    /// Drop every tensor and reset the pool.
    pub fn reset(&mut self) {
        self.tensors.clear();
        self.pool.reset();
    }

    /// Underlying pool.
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Underlying pool, mutably.
    pub fn pool_mut(&mut self) -> &mut MemoryPool {
        &mut self.pool
    }

    /// Drop every tensor and close the pool.
    pub fn close(&mut self) -> Result<()> {
        self.tensors.clear();
        self.pool.close()
    }
}

/// Three independent pool/allocator pairs, one per stream.
pub struct StreamAllocator {
    slots: [Mutex<TensorAllocator>; NUM_STREAMS],
}

impl StreamAllocator {
    /// Create one pool per stream from the same configuration.
    pub fn new(config: &PoolConfig) -> Self {
        let slots = StreamId::ALL.map(|stream| Mutex::new(TensorAllocator::new(stream, config.clone())));
        info!(
            "Initialized stream allocator: {} streams, arena_size={}",
            NUM_STREAMS, config.arena_size
        );
        Self { slots }
    }

    /// Exclusive access to one stream's tensor allocator.
    pub fn allocator(&self, stream: StreamId) -> MutexGuard<'_, TensorAllocator> {
        self.slots[stream.index()].lock()
    }

    /// Exclusive access to one stream's pool.
    pub fn pool(&self, stream: StreamId) -> MappedMutexGuard<'_, MemoryPool> {
        MutexGuard::map(self.slots[stream.index()].lock(), |alloc| alloc.pool_mut())
    }

    /// Reset one stream without touching the others.
    pub fn reset_stream(&self, stream: StreamId) {
        self.slots[stream.index()].lock().reset();
        debug!("Reset pool for stream {}", stream);
    }

    /// Reset all streams.
    pub fn reset_all(&self) {
        for stream in StreamId::ALL {
            self.reset_stream(stream);
        }
    }

    /// Pool statistics, one entry per stream.
    pub fn stats(&self) -> [PoolStats; NUM_STREAMS] {
        StreamId::ALL.map(|stream| self.slots[stream.index()].lock().pool().stats())
    }

    /// Tensor counts, one entry per stream.
    pub fn tensor_counts(&self) -> [usize; NUM_STREAMS] {
        StreamId::ALL.map(|stream| self.slots[stream.index()].lock().tensor_count())
    }

    /// Close every pool. Fails if already closed.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for slot in &self.slots {
            if let Err(e) = slot.lock().close() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("Stream allocator closed");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for StreamAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAllocator")
            .field("streams", &NUM_STREAMS)
            .finish()
    }
}
