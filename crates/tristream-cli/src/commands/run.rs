//! Run command - drive a synthetic workload through the engine.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tracing::info;

use tristream_core::{InferenceRequest, StreamId, TokenId};
use tristream_engine::{Health, ProductionEngine, ProductionMetrics};

use crate::load_config;
use crate::output::{format_duration, format_kv_list, format_number, format_table, print_section};

/// Run command arguments.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of requests, spread round-robin over the three streams.
    #[arg(short = 'n', long, default_value = "12")]
    pub requests: usize,

    /// Prompt length in tokens.
    #[arg(long, default_value = "16")]
    pub prompt_len: usize,

    /// Tokens to generate per request.
    #[arg(short, long, default_value = "32")]
    pub max_tokens: usize,

    /// Enable speculative decoding with the synthetic draft model.
    #[arg(long)]
    pub speculative: bool,

    /// Override the state directory.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Disable snapshots and recovery.
    #[arg(long)]
    pub no_persist: bool,

    /// Per-request timeout in seconds.
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Write the Prometheus text exposition to this file on exit.
    #[arg(long, value_name = "FILE")]
    pub prometheus: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    requests: usize,
    elapsed_seconds: f64,
    finish_reasons: Vec<(String, usize)>,
    metrics: ProductionMetrics,
    health: Health,
}

/// Execute the run command.
pub async fn execute(args: RunArgs, config_path: Option<String>, json: bool) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    if args.speculative {
        config.enable_speculative = true;
    }
    if let Some(dir) = args.state_dir.clone() {
        config = config.with_state_dir(dir);
    }
    if args.no_persist {
        config = config.without_persistence();
    }

    if !json {
        println!(
            "\n{} {} requests x {} tokens{}\n",
            "Running".bright_green().bold(),
            args.requests,
            args.max_tokens,
            if config.enable_speculative { " (speculative)" } else { "" }
        );
    }

    let engine = ProductionEngine::new(config).context("failed to build engine")?;
    engine.initialize().await.context("failed to initialize engine")?;
    if let Some(state) = engine.recovered_state() {
        info!("Resumed from snapshot '{}'", state.description);
    }
    engine.start()?;

    let start = Instant::now();
    let mut handles = Vec::with_capacity(args.requests);
    for i in 0..args.requests {
        let stream = StreamId::ALL[i % StreamId::ALL.len()];
        let request = InferenceRequest::new(stream, prompt(i, args.prompt_len), args.max_tokens)
            .with_metadata("demo_index", i.to_string());
        handles.push(engine.submit(request).await?);
    }

    let timeout = Duration::from_secs(args.timeout.max(1));
    let mut finish_reasons: Vec<(String, usize)> = Vec::new();
    for handle in handles {
        let response = handle.wait_timeout(timeout).await?;
        let reason = response.finish_reason.as_str().to_string();
        match finish_reasons.iter_mut().find(|(r, _)| *r == reason) {
            Some((_, count)) => *count += 1,
            None => finish_reasons.push((reason, 1)),
        }
    }
    let elapsed = start.elapsed();

    engine.stop().await?;
    while engine.try_next_completed().is_some() {}

    let report = RunReport {
        requests: args.requests,
        elapsed_seconds: elapsed.as_secs_f64(),
        finish_reasons,
        metrics: engine.metrics(),
        health: engine.health(),
    };
    engine.close().await?;

    if let Some(path) = &args.prometheus {
        let text = tristream_metrics::export_prometheus().context("failed to export metrics")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote Prometheus metrics to {}", path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

/// Deterministic prompt for request `index`.
fn prompt(index: usize, len: usize) -> Vec<TokenId> {
    (0..len.max(1))
        .map(|j| ((index * 31 + j * 7 + 1) % 1000) as TokenId)
        .collect()
}

fn print_report(report: &RunReport) {
    let m = &report.metrics;

    print_section("Requests");
    let min_latency = if m.min_latency_ms == u64::MAX { 0 } else { m.min_latency_ms };
    println!(
        "{}",
        format_kv_list(&[
            ("Submitted", format_number(m.total_requests)),
            ("Successful", format_number(m.successful_requests)),
            ("Failed", format_number(m.failed_requests)),
            ("Cancelled", format_number(m.cancelled_requests)),
            ("Tokens", format_number(m.total_tokens)),
            ("Elapsed", format_duration(report.elapsed_seconds)),
            ("Tokens/s", format!("{:.1}", m.tokens_per_second)),
            (
                "Latency (ms)",
                format!(
                    "avg {:.1}, min {}, max {}",
                    m.avg_latency_ms, min_latency, m.max_latency_ms
                )
            ),
        ])
    );

    print_section("Streams");
    let rows: Vec<Vec<String>> = StreamId::ALL
        .iter()
        .map(|stream| {
            let s = &m.streams[stream.index()];
            vec![
                stream.to_string(),
                s.requests.to_string(),
                s.completed.to_string(),
                s.tokens.to_string(),
                format!("{:.1}", s.avg_latency_ms),
            ]
        })
        .collect();
    print!(
        "{}",
        format_table(&["Stream", "Requests", "Completed", "Tokens", "Avg ms"], &rows)
    );

    print_section("Finish reasons");
    for (reason, count) in &report.finish_reasons {
        println!("  {:<10} {}", reason, count);
    }

    print_section("Health");
    for (name, component) in &report.health.components {
        let mark = if component.healthy {
            "✓".bright_green()
        } else {
            "✗".bright_red()
        };
        println!("  {} {:<12} {}", mark, name, component.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_is_deterministic() {
        assert_eq!(prompt(3, 4), prompt(3, 4));
        assert_ne!(prompt(3, 4), prompt(4, 4));
        assert_eq!(prompt(0, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_run_without_persistence() {
        let args = RunArgs {
            requests: 6,
            prompt_len: 4,
            max_tokens: 8,
            speculative: true,
            state_dir: None,
            no_persist: true,
            timeout: 10,
            prometheus: None,
        };
        execute(args, None, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_writes_shutdown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            requests: 3,
            prompt_len: 4,
            max_tokens: 4,
            speculative: false,
            state_dir: Some(dir.path().to_path_buf()),
            no_persist: false,
            timeout: 10,
            prometheus: None,
        };
        execute(args, None, true).await.unwrap();
        assert!(dir.path().join(tristream_state::INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn test_run_dumps_prometheus_text() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("metrics.prom");
        let args = RunArgs {
            requests: 3,
            prompt_len: 4,
            max_tokens: 4,
            speculative: false,
            state_dir: None,
            no_persist: true,
            timeout: 10,
            prometheus: Some(out.clone()),
        };
        execute(args, None, true).await.unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("tristream_batches_total"));
        assert!(text.contains("# TYPE"));
    }
}
