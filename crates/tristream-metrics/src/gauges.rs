//! Gauge metrics.

use prometheus::{Gauge, GaugeVec, Opts};
use std::sync::OnceLock;

use crate::{register, MetricsError};

/// Sequences currently generating.
static ACTIVE_SEQUENCES: OnceLock<Gauge> = OnceLock::new();

/// Queue depth by queue (pending, running).
static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// KV cache tokens in use.
static KV_CACHE_USED: OnceLock<Gauge> = OnceLock::new();

/// Pool bytes in use by stream.
static POOL_BYTES: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize gauges.
pub fn init_gauges() -> Result<(), MetricsError> {
    let active = Gauge::with_opts(Opts::new(
        "tristream_active_sequences",
        "Sequences currently generating",
    ))?;
    ACTIVE_SEQUENCES
        .set(active.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(active)?;

    let queue_depth = GaugeVec::new(
        Opts::new("tristream_queue_depth", "Scheduler queue depth"),
        &["queue"],
    )?;
    QUEUE_DEPTH
        .set(queue_depth.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(queue_depth)?;

    let kv_used = Gauge::with_opts(Opts::new(
        "tristream_kv_cache_used_tokens",
        "KV cache tokens in use",
    ))?;
    KV_CACHE_USED
        .set(kv_used.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(kv_used)?;

    let pool_bytes = GaugeVec::new(
        Opts::new("tristream_pool_bytes", "Memory pool bytes in use"),
        &["stream"],
    )?;
    POOL_BYTES
        .set(pool_bytes.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(pool_bytes)?;

    Ok(())
}

/// Set active sequences.
pub fn set_active_sequences(count: usize) {
    if let Some(gauge) = ACTIVE_SEQUENCES.get() {
        gauge.set(count as f64);
    }
}

/// Set queue depth.
pub fn set_queue_depth(queue: &str, depth: usize) {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.with_label_values(&[queue]).set(depth as f64);
    }
}

/// Set KV cache usage.
pub fn set_kv_cache_used(tokens: usize) {
    if let Some(gauge) = KV_CACHE_USED.get() {
        gauge.set(tokens as f64);
    }
}

/// Set pool usage for one stream.
pub fn set_pool_bytes(stream: &str, bytes: u64) {
    if let Some(gauge) = POOL_BYTES.get() {
        gauge.with_label_values(&[stream]).set(bytes as f64);
    }
}

/// Get queue depth.
pub fn get_queue_depth(queue: &str) -> f64 {
    QUEUE_DEPTH
        .get()
        .map(|g| g.with_label_values(&[queue]).get())
        .unwrap_or(0.0)
}

/// Get KV cache usage.
pub fn get_kv_cache_used() -> f64 {
    KV_CACHE_USED.get().map(|g| g.get()).unwrap_or(0.0)
}
