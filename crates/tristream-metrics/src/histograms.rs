//! Histogram metrics.

use prometheus::{HistogramOpts, HistogramVec};
use std::sync::OnceLock;
use std::time::Instant;

use crate::{register, MetricsError};

/// Request latency by stream.
static REQUEST_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Batch step duration by phase.
static BATCH_STEP: OnceLock<HistogramVec> = OnceLock::new();

/// Default latency buckets (in seconds).
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fine-grained buckets for a single batch step.
pub const STEP_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25,
];

/// Initialize histograms.
pub fn init_histograms() -> Result<(), MetricsError> {
    let request_latency = HistogramVec::new(
        HistogramOpts::new("tristream_request_latency_seconds", "Request latency")
            .buckets(DEFAULT_LATENCY_BUCKETS.to_vec()),
        &["stream"],
    )?;
    REQUEST_LATENCY
        .set(request_latency.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(request_latency)?;

    let batch_step = HistogramVec::new(
        HistogramOpts::new("tristream_batch_step_seconds", "Batch step duration")
            .buckets(STEP_LATENCY_BUCKETS.to_vec()),
        &["phase"],
    )?;
    BATCH_STEP
        .set(batch_step.clone())
        .map_err(|_| MetricsError::AlreadyInitialized)?;
    register(batch_step)?;

    Ok(())
}

/// Record request latency.
pub fn observe_request_latency(stream: &str, seconds: f64) {
    if let Some(hist) = REQUEST_LATENCY.get() {
        hist.with_label_values(&[stream]).observe(seconds);
    }
}

/// Record a batch step duration.
pub fn observe_batch_step(phase: &str, seconds: f64) {
    if let Some(hist) = BATCH_STEP.get() {
        hist.with_label_values(&[phase]).observe(seconds);
    }
}

/// Get the number of recorded batch steps for a phase.
pub fn get_batch_step_count(phase: &str) -> u64 {
    BATCH_STEP
        .get()
        .map(|h| h.with_label_values(&[phase]).get_sample_count())
        .unwrap_or(0)
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in seconds.
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop and record as a batch step.
    pub fn observe_batch_step(self, phase: &str) {
        observe_batch_step(phase, self.elapsed_seconds());
    }
}
