//! Tristream Metrics and Observability.
//!
//! Structured logging setup and Prometheus collectors for the serving
//! engine. Collectors live in process-wide `OnceLock`s; recording before
//! [`init_metrics`] is a no-op, so library code can record unconditionally.
//!
//! # Example
//!
//! ```rust,ignore
//! use tristream_metrics::{init_metrics, inc_batches, export_prometheus};
//!
//! init_metrics()?;
//! inc_batches("decode");
//! println!("{}", export_prometheus()?);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod counters;
pub mod gauges;
pub mod histograms;
pub mod tracing_setup;

pub use counters::*;
pub use gauges::*;
pub use histograms::*;
pub use tracing_setup::{init_tracing, LogFormat, TracingConfig};

use ::prometheus::core::Collector;
use ::prometheus::{Encoder, TextEncoder};
use thiserror::Error;

/// Metrics error.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Collectors were already registered.
    #[error("Metrics already initialized")]
    AlreadyInitialized,

    /// Prometheus rejected a collector or failed to encode.
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] ::prometheus::Error),

    /// The tracing subscriber could not be installed.
    #[error("Tracing error: {0}")]
    TracingError(String),
}

/// Register every collector with the default registry.
pub fn init_metrics() -> Result<(), MetricsError> {
    counters::init_counters()?;
    gauges::init_gauges()?;
    histograms::init_histograms()?;
    Ok(())
}

/// Like [`init_metrics`], treating a previous initialization as success.
pub fn ensure_metrics() -> Result<(), MetricsError> {
    tolerate_initialized(counters::init_counters())?;
    tolerate_initialized(gauges::init_gauges())?;
    tolerate_initialized(histograms::init_histograms())
}

fn tolerate_initialized(result: Result<(), MetricsError>) -> Result<(), MetricsError> {
    match result {
        Ok(()) | Err(MetricsError::AlreadyInitialized) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Export metrics in Prometheus text format.
pub fn export_prometheus() -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = ::prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

pub(crate) fn register<C: Collector + 'static>(collector: C) -> Result<(), MetricsError> {
    ::prometheus::register(Box::new(collector))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_export() {
        ensure_metrics().unwrap();
        ensure_metrics().unwrap();

        inc_batches("prefill");
        inc_tokens("alpha", "generated", 5);
        set_kv_cache_used(128);
        observe_batch_step("prefill", 0.002);

        assert!(get_batch_count("prefill") >= 1.0);
        assert!(get_token_count("alpha", "generated") >= 5.0);
        assert_eq!(get_kv_cache_used(), 128.0);
        assert!(get_batch_step_count("prefill") >= 1);

        let text = export_prometheus().unwrap();
        assert!(text.contains("tristream_batches_total"));
    }
}
