//! Snapshots command - list and inspect persisted engine state.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;

use tristream_core::StreamId;
use tristream_state::{read_binary_state_with_header, CognitiveState, StateHeader, StateManager};

use crate::load_config;
use crate::output::{format_bytes, format_kv_list, format_table, print_info, print_section};

/// Snapshot subcommands.
#[derive(Subcommand, Debug)]
pub enum SnapshotsCommand {
    /// List the snapshot index of a state directory.
    List(ListArgs),

    /// Print the header and contents of one snapshot file.
    Inspect(InspectArgs),
}

/// List arguments.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// State directory; defaults to the configured one.
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Only show checkpoints.
    #[arg(long)]
    pub checkpoints: bool,
}

/// Inspect arguments.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Snapshot file.
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
struct Inspection<'a> {
    path: String,
    version: u32,
    checkpoint: bool,
    compressed: bool,
    payload_bytes: u64,
    description: &'a str,
    timestamp: String,
    checksum: &'a str,
    streams: Vec<StreamSummary>,
    kv_cache_used: usize,
    kv_cache_capacity: usize,
    completed_sequences: u64,
    total_requests: u64,
    total_tokens: u64,
}

#[derive(Debug, Serialize)]
struct StreamSummary {
    stream: &'static str,
    step: u64,
    tokens_generated: u64,
    requests: u64,
    draft_length: usize,
}

/// Execute a snapshots subcommand.
pub fn execute(command: SnapshotsCommand, config_path: Option<String>, json: bool) -> Result<()> {
    match command {
        SnapshotsCommand::List(args) => list(args, config_path, json),
        SnapshotsCommand::Inspect(args) => inspect(args, json),
    }
}

fn list(args: ListArgs, config_path: Option<String>, json: bool) -> Result<()> {
    let mut state_config = load_config(config_path.as_deref())?.state;
    if let Some(dir) = args.dir {
        state_config.storage_dir = dir;
    }

    let manager = StateManager::new(state_config);
    manager
        .initialize()
        .with_context(|| format!("cannot open {}", manager.storage_dir().display()))?;

    let snapshots: Vec<_> = manager
        .list_snapshots()
        .into_iter()
        .filter(|s| !args.checkpoints || s.is_checkpoint)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    print_section(&format!("Snapshots in {}", manager.storage_dir().display()));
    if snapshots.is_empty() {
        print_info("no snapshots");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = snapshots
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                if s.is_checkpoint { "checkpoint" } else { "snapshot" }.to_string(),
                s.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                format_bytes(s.size_bytes),
                s.description.clone(),
            ]
        })
        .collect();
    print!(
        "{}",
        format_table(&["ID", "Kind", "Time (UTC)", "Size", "Description"], &rows)
    );

    Ok(())
}

fn inspect(args: InspectArgs, json: bool) -> Result<()> {
    let file = File::open(&args.path)
        .with_context(|| format!("cannot open {}", args.path.display()))?;
    let (header, state) = read_binary_state_with_header(&mut BufReader::new(file))
        .with_context(|| format!("cannot read {}", args.path.display()))?;

    let report = inspection(&args.path, &header, &state);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_section(&format!("Snapshot {}", report.path));
    println!(
        "{}",
        format_kv_list(&[
            ("Version", report.version.to_string()),
            ("Checkpoint", report.checkpoint.to_string()),
            ("Compressed", report.compressed.to_string()),
            ("Payload", format_bytes(report.payload_bytes)),
            ("Captured", report.timestamp.clone()),
            ("Description", report.description.to_string()),
            ("Checksum", report.checksum.to_string()),
            (
                "KV cache",
                format!("{} / {} tokens", report.kv_cache_used, report.kv_cache_capacity)
            ),
            ("Completed", report.completed_sequences.to_string()),
            ("Requests", report.total_requests.to_string()),
            ("Tokens", report.total_tokens.to_string()),
        ])
    );

    print_section("Streams");
    let rows: Vec<Vec<String>> = report
        .streams
        .iter()
        .map(|s| {
            vec![
                s.stream.to_string(),
                s.step.to_string(),
                s.tokens_generated.to_string(),
                s.requests.to_string(),
                s.draft_length.to_string(),
            ]
        })
        .collect();
    print!(
        "{}",
        format_table(&["Stream", "Step", "Tokens", "Requests", "Draft"], &rows)
    );

    Ok(())
}

fn inspection<'a>(
    path: &std::path::Path,
    header: &StateHeader,
    state: &'a CognitiveState,
) -> Inspection<'a> {
    Inspection {
        path: path.display().to_string(),
        version: header.version,
        checkpoint: header.is_checkpoint(),
        compressed: header.is_compressed(),
        payload_bytes: header.payload_len,
        description: &state.description,
        timestamp: state.timestamp.to_rfc3339(),
        checksum: &state.checksum,
        streams: StreamId::ALL
            .iter()
            .map(|stream| {
                let s = &state.streams[stream.index()];
                StreamSummary {
                    stream: stream.as_str(),
                    step: s.step,
                    tokens_generated: s.tokens_generated,
                    requests: s.requests,
                    draft_length: s.draft_length,
                }
            })
            .collect(),
        kv_cache_used: state.kv_cache.used,
        kv_cache_capacity: state.kv_cache.capacity,
        completed_sequences: state.batcher.completed,
        total_requests: state.metrics.total_requests,
        total_tokens: state.metrics.total_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tristream_config::StateConfig;

    #[test]
    fn test_inspect_written_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(StateConfig::in_dir(dir.path()));
        manager.initialize().unwrap();

        let mut state = CognitiveState::new("cli");
        state.streams[StreamId::Beta.index()].step = 9;
        let info = manager.save_state(&state, "before upgrade").unwrap();

        let file = File::open(&info.path).unwrap();
        let (header, loaded) = read_binary_state_with_header(&mut BufReader::new(file)).unwrap();
        let report = inspection(&info.path, &header, &loaded);
        assert_eq!(report.description, "before upgrade");
        assert!(!report.checkpoint);
        assert!(report.compressed);
        assert_eq!(report.streams[1].stream, "beta");
        assert_eq!(report.streams[1].step, 9);

        inspect(InspectArgs { path: info.path }, true).unwrap();
    }

    #[test]
    fn test_list_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let args = ListArgs {
            dir: Some(dir.path().to_path_buf()),
            checkpoints: false,
        };
        list(args, None, true).unwrap();
    }

    #[test]
    fn test_inspect_missing_file() {
        let args = InspectArgs {
            path: PathBuf::from("/nonexistent/state.trst"),
        };
        assert!(inspect(args, true).is_err());
    }
}
