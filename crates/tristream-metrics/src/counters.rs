//! Counter metrics.

use prometheus::{CounterVec, IntCounter, Opts};
use std::sync::OnceLock;

use crate::{register, MetricsError};

/// Completed requests by stream and outcome.
static REQUEST_COUNTER: OnceLock<CounterVec> = OnceLock::new();

/// Tokens by stream and kind (prompt, generated).
static TOKEN_COUNTER: OnceLock<CounterVec> = OnceLock::new();

/// Batches executed by phase.
static BATCH_COUNTER: OnceLock<CounterVec> = OnceLock::new();

/// Speculative draft tokens by outcome (accepted, rejected, bonus).
static SPECULATIVE_COUNTER: OnceLock<CounterVec> = OnceLock::new();

/// KV cache slots evicted.
static EVICTION_COUNTER: OnceLock<IntCounter> = OnceLock::new();

/// Initialize counters.
pub fn init_counters() -> Result<(), MetricsError> {
    let request_counter = CounterVec::new(
        Opts::new("tristream_requests_total", "Completed requests"),
        &["stream", "status"],
    )?;
    REQUEST_COUNTER
        .set(request_counter.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(request_counter)?;

    let token_counter = CounterVec::new(
        Opts::new("tristream_tokens_total", "Tokens processed"),
        &["stream", "kind"],
    )?;
    TOKEN_COUNTER
        .set(token_counter.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(token_counter)?;

    let batch_counter = CounterVec::new(
        Opts::new("tristream_batches_total", "Batches executed"),
        &["phase"],
    )?;
    BATCH_COUNTER
        .set(batch_counter.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(batch_counter)?;

    let speculative_counter = CounterVec::new(
        Opts::new(
            "tristream_speculative_tokens_total",
            "Speculative draft tokens by verification outcome",
        ),
        &["outcome"],
    )?;
    SPECULATIVE_COUNTER
        .set(speculative_counter.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(speculative_counter)?;

    let eviction_counter = IntCounter::with_opts(Opts::new(
        "tristream_kv_evictions_total",
        "KV cache slots evicted",
    ))?;
    EVICTION_COUNTER
        .set(eviction_counter.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(eviction_counter)?;

    Ok(())
}

/// Increment request counter.
pub fn inc_requests(stream: &str, status: &str) {
    if let Some(counter) = REQUEST_COUNTER.get() {
        counter.with_label_values(&[stream, status]).inc();
    }
}

/// Add to token counter.
pub fn inc_tokens(stream: &str, kind: &str, count: u64) {
    if let Some(counter) = TOKEN_COUNTER.get() {
        counter
            .with_label_values(&[stream, kind])
            .inc_by(count as f64);
    }
}

/// Increment batch counter.
pub fn inc_batches(phase: &str) {
    if let Some(counter) = BATCH_COUNTER.get() {
        counter.with_label_values(&[phase]).inc();
    }
}

/// Add to speculative token counter.
pub fn add_speculative_tokens(outcome: &str, count: u64) {
    if let Some(counter) = SPECULATIVE_COUNTER.get() {
        counter.with_label_values(&[outcome]).inc_by(count as f64);
    }
}

/// Add to eviction counter.
pub fn inc_evictions(count: u64) {
    if let Some(counter) = EVICTION_COUNTER.get() {
        counter.inc_by(count);
    }
}

/// Get current request count.
pub fn get_request_count(stream: &str, status: &str) -> f64 {
    REQUEST_COUNTER
        .get()
        .map(|c| c.with_label_values(&[stream, status]).get())
        .unwrap_or(0.0)
}

/// Get current token count.
pub fn get_token_count(stream: &str, kind: &str) -> f64 {
    TOKEN_COUNTER
        .get()
        .map(|c| c.with_label_values(&[stream, kind]).get())
        .unwrap_or(0.0)
}

/// Get current batch count.
pub fn get_batch_count(phase: &str) -> f64 {
    BATCH_COUNTER
        .get()
        .map(|c| c.with_label_values(&[phase]).get())
        .unwrap_or(0.0)
}
