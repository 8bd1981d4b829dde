//! End-to-end runs of the production engine against the synthetic backend.

use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use tempfile::TempDir;

use tristream_config::ProductionConfig;
use tristream_core::{FinishReason, InferenceRequest, StreamId};
use tristream_engine::{ProductionEngine, StreamMultiplexer};
use tristream_state::{read_binary_state_with_header, IncrementalStateManager, StateDelta};

fn config(dir: &TempDir) -> ProductionConfig {
    let mut config = ProductionConfig::new("synthetic").with_state_dir(dir.path());
    config.batch.max_wait_time_ms = 2;
    config.state.checkpoint_interval_ms = 0;
    config
}

async fn running(config: ProductionConfig) -> ProductionEngine {
    let engine = ProductionEngine::new(config).unwrap();
    engine.initialize().await.unwrap();
    engine.start().unwrap();
    engine
}

fn request(stream: StreamId, max_new: usize) -> InferenceRequest {
    InferenceRequest::new(stream, vec![1, 2, 3, 4], max_new)
}

#[tokio::test]
async fn three_streams_share_one_batcher() {
    let dir = TempDir::new().unwrap();
    let engine = running(config(&dir)).await;

    let mut handles = Vec::new();
    for round in 0..3 {
        for stream in StreamId::ALL {
            handles.push(engine.submit(request(stream, 3 + round)).await.unwrap());
        }
    }
    for handle in handles {
        let response = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(response.finish_reason, FinishReason::Length);
    }
    // Stopping drains the completion path into the metrics.
    engine.stop().await.unwrap();

    let metrics = engine.metrics();
    assert_eq!(metrics.total_requests, 9);
    assert_eq!(metrics.successful_requests, 9);
    for stream in StreamId::ALL {
        let per_stream = &metrics.streams[stream.index()];
        assert_eq!(per_stream.requests, 3);
        assert_eq!(per_stream.tokens, 3 + 4 + 5);
    }
    assert_eq!(engine.kv_cache().used(), 0);

    engine.close().await.unwrap();
}

#[tokio::test]
async fn multiplexer_tags_tokens_with_their_stream() {
    let dir = TempDir::new().unwrap();
    let engine = running(config(&dir).without_persistence()).await;

    let mut handles = Vec::new();
    let mut streams = Vec::new();
    for stream in StreamId::ALL {
        let handle = engine.submit(request(stream, 4)).await.unwrap();
        streams.push(handle.stream().unwrap().stream().clone());
        handles.push(handle);
    }

    let mux = StreamMultiplexer::new(streams);
    let mut counts = [0usize; 3];
    while let Some((index, token)) = mux.recv_timeout(Duration::from_secs(5)).await.unwrap() {
        assert_eq!(token.stream, StreamId::ALL[index]);
        counts[index] += 1;
    }
    assert_eq!(counts, [4, 4, 4]);

    for handle in handles {
        assert_eq!(handle.wait().await.unwrap().tokens.len(), 4);
    }
    engine.close().await.unwrap();
}

#[tokio::test]
async fn cancel_finishes_a_long_request() {
    let dir = TempDir::new().unwrap();
    let engine = running(config(&dir).without_persistence()).await;

    let handle = engine.submit(request(StreamId::Beta, 2000)).await.unwrap();
    assert!(engine.cancel(handle.id()));
    let response = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.finish_reason, FinishReason::Cancelled);
    assert!(!response.is_success());

    engine.stop().await.unwrap();
    let metrics = engine.metrics();
    assert_eq!(metrics.cancelled_requests, 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn shutdown_checkpoint_is_readable_and_extendable() {
    let dir = TempDir::new().unwrap();
    let engine = running(config(&dir)).await;
    for stream in StreamId::ALL {
        engine
            .submit(request(stream, 2).with_step(10 + stream.index() as u64))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    engine.stop().await.unwrap();
    let info = engine.state_manager().unwrap().latest_checkpoint().unwrap();
    engine.close().await.unwrap();

    let file = File::open(&info.path).unwrap();
    let (header, state) = read_binary_state_with_header(&mut BufReader::new(file)).unwrap();
    assert!(header.is_checkpoint());
    assert_eq!(state.description, "shutdown");
    assert!(state.verify_checksum().unwrap());
    for stream in StreamId::ALL {
        let s = &state.streams[stream.index()];
        assert_eq!(s.step, 10 + stream.index() as u64);
        assert_eq!(s.tokens_generated, 2);
    }
    assert_eq!(state.metrics.total_tokens, 6);

    let incremental = IncrementalStateManager::new(state.clone());
    incremental.record_delta(StateDelta::StreamStep {
        stream: StreamId::Alpha,
        step: 99,
    });
    incremental.record_delta(StateDelta::Description("resumed".into()));
    let updated = incremental.apply_deltas().unwrap();
    assert_eq!(updated.streams[StreamId::Alpha.index()].step, 99);
    assert_eq!(updated.description, "resumed");
    assert_eq!(incremental.base().streams[StreamId::Alpha.index()].step, 10);

    let manager = engine.state_manager().unwrap();
    let saved = manager.save_state(&updated, "resumed").unwrap();
    let reloaded = manager.load_state(&saved.path).unwrap();
    assert_eq!(reloaded.streams[StreamId::Alpha.index()].step, 99);
}

#[tokio::test]
async fn restart_resumes_stream_steps() {
    let dir = TempDir::new().unwrap();
    {
        let engine = running(config(&dir)).await;
        engine
            .submit(request(StreamId::Beta, 2).with_step(7))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        engine.stop().await.unwrap();
        engine.close().await.unwrap();
    }

    let engine = running(config(&dir)).await;
    assert_eq!(engine.stream_step(StreamId::Beta), 7);
    engine
        .submit(request(StreamId::Beta, 2))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(engine.stream_step(StreamId::Beta), 7);
    engine.stop().await.unwrap();
    assert_eq!(engine.metrics().streams[StreamId::Beta.index()].tokens, 4);
    engine.close().await.unwrap();
}
