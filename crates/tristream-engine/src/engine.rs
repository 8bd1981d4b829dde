//! Production engine.
//!
//! Wires the per-stream memory pools, the KV cache, the continuous batcher,
//! optional speculative decoding and state persistence into one lifecycle:
//! [`initialize`](ProductionEngine::initialize), [`start`](ProductionEngine::start),
//! [`stop`](ProductionEngine::stop), [`close`](ProductionEngine::close).
//!
//! Every completed response passes through a completion task that updates
//! [`ProductionMetrics`], releases the prompt's staging tensor and forwards
//! the response to [`ProductionEngine::next_completed`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tristream_config::ProductionConfig;
use tristream_core::{
    DType, Error, FinishReason, InferenceRequest, InferenceResponse, Result, SequenceId, StreamId,
    NUM_STREAMS,
};
use tristream_state::{
    BatcherSnapshot, CognitiveState, KvCacheSnapshot, MemoryPoolSnapshot, MetricsSnapshot,
    SnapshotInfo, SpeculativeSnapshot, StateManager, StreamState,
};

use crate::allocator::{StreamAllocator, TensorId};
use crate::backend::{ComputeBackend, SyntheticBackend, SyntheticConfig, SyntheticDraft};
use crate::batcher::{BatcherStats, ContinuousBatcher, SequenceHandle};
use crate::kv_cache::KvCacheManager;
use crate::speculative::{DraftModel, SpeculativeBackend, SpeculativeEngine, TargetModel};

/// Draft divergence period of the default synthetic draft model.
const SYNTHETIC_DRAFT_MISS_EVERY: usize = 4;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Built, not yet initialized
    Created,
    /// Storage prepared and state recovered
    Initialized,
    /// Accepting requests
    Running,
    /// Background tasks stopped
    Stopped,
    /// Pools released
    Closed,
}

impl EngineStatus {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Created => "created",
            EngineStatus::Initialized => "initialized",
            EngineStatus::Running => "running",
            EngineStatus::Stopped => "stopped",
            EngineStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stream request metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Requests submitted
    pub requests: u64,
    /// Requests finished, any outcome
    pub completed: u64,
    /// Tokens generated
    pub tokens: u64,
    /// Mean latency of finished requests
    pub avg_latency_ms: f64,
}

/// Engine-wide request metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionMetrics {
    /// Requests submitted
    pub total_requests: u64,
    /// Requests finished with stop, length or empty
    pub successful_requests: u64,
    /// Requests evicted or failed
    pub failed_requests: u64,
    /// Requests cancelled
    pub cancelled_requests: u64,
    /// Tokens generated
    pub total_tokens: u64,
    /// Prompt tokens processed
    pub total_prompt_tokens: u64,
    /// Fastest request; `u64::MAX` until one finishes
    pub min_latency_ms: u64,
    /// Slowest request
    pub max_latency_ms: u64,
    /// Mean latency
    pub avg_latency_ms: f64,
    /// Generated tokens per second of uptime
    pub tokens_per_second: f64,
    /// Time since `start`
    pub uptime: Duration,
    /// Per stream, indexed by stream id
    pub streams: [StreamMetrics; NUM_STREAMS],
}

impl Default for ProductionMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            cancelled_requests: 0,
            total_tokens: 0,
            total_prompt_tokens: 0,
            min_latency_ms: u64::MAX,
            max_latency_ms: 0,
            avg_latency_ms: 0.0,
            tokens_per_second: 0.0,
            uptime: Duration::ZERO,
            streams: Default::default(),
        }
    }
}

impl ProductionMetrics {
    /// Requests finished with any outcome.
    pub fn completed_requests(&self) -> u64 {
        self.successful_requests + self.failed_requests + self.cancelled_requests
    }

    fn record_submit(&mut self, stream: StreamId) {
        self.total_requests += 1;
        self.streams[stream.index()].requests += 1;
    }

    fn record_completion(&mut self, response: &InferenceResponse) {
        match response.finish_reason {
            reason if reason.is_success() => self.successful_requests += 1,
            FinishReason::Cancelled => self.cancelled_requests += 1,
            _ => self.failed_requests += 1,
        }

        let tokens = response.completion_tokens() as u64;
        let latency = response.latency_ms;
        self.total_tokens += tokens;
        self.total_prompt_tokens += response.prompt_tokens as u64;
        self.min_latency_ms = self.min_latency_ms.min(latency);
        self.max_latency_ms = self.max_latency_ms.max(latency);
        let n = self.completed_requests() as f64;
        self.avg_latency_ms += (latency as f64 - self.avg_latency_ms) / n;

        let stream = &mut self.streams[response.stream.index()];
        stream.completed += 1;
        stream.tokens += tokens;
        stream.avg_latency_ms += (latency as f64 - stream.avg_latency_ms) / stream.completed as f64;
    }
}

/// Health of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Whether the component is usable
    pub healthy: bool,
    /// Short status line
    pub message: String,
}

impl ComponentHealth {
    fn new(healthy: bool, message: impl Into<String>) -> Self {
        Self {
            healthy,
            message: message.into(),
        }
    }

    fn disabled() -> Self {
        Self::new(true, "disabled")
    }
}

/// Engine health report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    /// Initialized, not closed, and every component healthy
    pub healthy: bool,
    /// `initialize` has completed
    pub initialized: bool,
    /// Accepting requests
    pub running: bool,
    /// Lifecycle state
    pub status: EngineStatus,
    /// Time since `start`
    pub uptime: Duration,
    /// Per component: pools, batcher, speculative, state, streaming
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Default)]
struct Staging {
    tensors: HashMap<SequenceId, (StreamId, TensorId)>,
    /// Sequences that finished before their staging tensor was recorded.
    finished: HashSet<SequenceId>,
}

struct Inner {
    config: ProductionConfig,
    backend_name: String,
    allocator: Option<StreamAllocator>,
    kv: Arc<KvCacheManager>,
    batcher: ContinuousBatcher,
    speculative: Option<Arc<SpeculativeEngine>>,
    state: Option<Arc<StateManager>>,
    metrics: RwLock<ProductionMetrics>,
    steps: [AtomicU64; NUM_STREAMS],
    staging: Mutex<Staging>,
    started_at: Mutex<Option<Instant>>,
    outbox: mpsc::UnboundedSender<InferenceResponse>,
}

impl Inner {
    fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn snapshot_metrics(&self) -> ProductionMetrics {
        let mut metrics = self.metrics.read().clone();
        metrics.uptime = self.uptime();
        let secs = metrics.uptime.as_secs_f64();
        metrics.tokens_per_second = if secs > 0.0 {
            metrics.total_tokens as f64 / secs
        } else {
            0.0
        };
        metrics
    }

    /// Copy the prompt into the stream's pool for the backend.
    fn stage_prompt(&self, request: &InferenceRequest) -> Result<Option<TensorId>> {
        let Some(allocator) = &self.allocator else {
            return Ok(None);
        };
        let mut alloc = allocator.allocator(request.stream);
        let id = alloc.alloc_tensor(
            "prompt",
            &[request.prompt_tokens.len()],
            DType::I32,
            request.stream,
        )?;
        let bytes = alloc.tensor_bytes_mut(id)?;
        bytes.copy_from_slice(bytemuck::cast_slice(request.prompt_tokens.as_slice()));
        Ok(Some(id))
    }

    fn track_staged(&self, sequence: SequenceId, stream: StreamId, tensor: TensorId) {
        let finished = {
            let mut staging = self.staging.lock();
            if staging.finished.remove(&sequence) {
                true
            } else {
                staging.tensors.insert(sequence, (stream, tensor));
                false
            }
        };
        if finished {
            self.free_staged(stream, tensor);
        }
    }

    fn release_staged(&self, response: &InferenceResponse) {
        if self.allocator.is_none() || response.finish_reason == FinishReason::Empty {
            return;
        }
        let entry = {
            let mut staging = self.staging.lock();
            let entry = staging.tensors.remove(&response.sequence_id);
            if entry.is_none() {
                staging.finished.insert(response.sequence_id);
            }
            entry
        };
        if let Some((stream, tensor)) = entry {
            self.free_staged(stream, tensor);
        }
    }

    fn free_staged(&self, stream: StreamId, tensor: TensorId) {
        let Some(allocator) = &self.allocator else {
            return;
        };
        let mut alloc = allocator.allocator(stream);
        if let Err(e) = alloc.free_tensor(tensor) {
            debug!("Staging {} on {} already gone: {}", tensor, stream, e);
        }
        // An idle stream gets its arenas back in one piece.
        if alloc.tensor_count() == 0 {
            alloc.reset();
        }
    }

    fn on_completed(&self, response: InferenceResponse) {
        self.metrics.write().record_completion(&response);
        self.release_staged(&response);
        debug!(
            "{} finished: {} after {} tokens in {}ms",
            response.sequence_id,
            response.finish_reason,
            response.completion_tokens(),
            response.latency_ms
        );
        let _ = self.outbox.send(response);
    }

    fn publish_gauges(&self) {
        let stats = self.batcher.stats();
        tristream_metrics::set_active_sequences(stats.pending + stats.running);
        tristream_metrics::set_queue_depth("pending", stats.pending);
        tristream_metrics::set_queue_depth("running", stats.running);
        tristream_metrics::set_kv_cache_used(stats.kv_used);
        if let Some(allocator) = &self.allocator {
            for (stream, pool) in StreamId::ALL.iter().zip(allocator.stats()) {
                tristream_metrics::set_pool_bytes(stream.as_str(), pool.current_usage);
            }
        }
        debug!(
            "Engine gauges: pending={}, running={}, kv={}/{}",
            stats.pending, stats.running, stats.kv_used, stats.kv_capacity
        );
    }

    fn capture_state(&self) -> CognitiveState {
        let metrics = self.snapshot_metrics();
        let mut state = CognitiveState::new("");

        for stream in StreamId::ALL {
            let i = stream.index();
            state.streams[i] = StreamState {
                step: self.steps[i].load(Ordering::Relaxed),
                tokens_generated: metrics.streams[i].tokens,
                requests: metrics.streams[i].completed,
                submitted: metrics.streams[i].requests,
                avg_latency_ms: metrics.streams[i].avg_latency_ms,
                draft_length: self
                    .speculative
                    .as_ref()
                    .map_or(0, |s| s.draft_length(stream)),
            };
        }

        let kv = self.kv.stats();
        state.kv_cache = KvCacheSnapshot {
            used: kv.used,
            capacity: kv.capacity,
            slot_count: kv.slot_count,
            evictions: kv.evictions,
        };

        let batcher = self.batcher.stats();
        state.batcher = BatcherSnapshot {
            sequence_count: batcher.sequence_count,
            batch_count: batcher.batch_count,
            completed: batcher.completed,
            cancelled: batcher.cancelled,
            noop_completions: batcher.noop_completions,
            failed_batches: batcher.failed_batches,
        };

        if let Some(allocator) = &self.allocator {
            for (slot, pool) in state.memory.iter_mut().zip(allocator.stats()) {
                *slot = MemoryPoolSnapshot {
                    total_allocated: pool.total_allocated,
                    current_usage: pool.current_usage,
                    peak_usage: pool.peak_usage,
                    arena_count: pool.arena_count,
                    reset_count: pool.reset_count,
                };
            }
        }

        if let Some(spec) = &self.speculative {
            let stats = spec.stats();
            state.speculative = SpeculativeSnapshot {
                enabled: true,
                iterations: stats.iterations,
                accepted: stats.accepted,
                rejected: stats.rejected,
                acceptance_rate: stats.acceptance_rate(),
            };
        }

        state.metrics = MetricsSnapshot {
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            cancelled_requests: metrics.cancelled_requests,
            total_tokens: metrics.total_tokens,
            total_prompt_tokens: metrics.total_prompt_tokens,
            min_latency_ms: metrics.min_latency_ms,
            max_latency_ms: metrics.max_latency_ms,
            avg_latency_ms: metrics.avg_latency_ms,
            uptime_ms: metrics.uptime.as_millis() as u64,
        };

        state
            .metadata
            .insert("model_path".into(), self.config.model_path.clone());
        state
            .metadata
            .insert("backend".into(), self.backend_name.clone());
        state
    }

    fn restore(&self, state: &CognitiveState) {
        let mut metrics = self.metrics.write();
        for stream in StreamId::ALL {
            let i = stream.index();
            let saved = &state.streams[i];
            self.steps[i].store(saved.step, Ordering::Relaxed);
            metrics.streams[i] = StreamMetrics {
                requests: saved.submitted,
                completed: saved.requests,
                tokens: saved.tokens_generated,
                avg_latency_ms: saved.avg_latency_ms,
            };
            if let Some(spec) = &self.speculative {
                if saved.draft_length > 0 {
                    spec.set_draft_length(stream, saved.draft_length);
                }
            }
        }
        let saved = &state.metrics;
        metrics.total_requests = saved.total_requests;
        metrics.successful_requests = saved.successful_requests;
        metrics.failed_requests = saved.failed_requests;
        metrics.cancelled_requests = saved.cancelled_requests;
        metrics.total_tokens = saved.total_tokens;
        metrics.total_prompt_tokens = saved.total_prompt_tokens;
        metrics.avg_latency_ms = saved.avg_latency_ms;
        metrics.max_latency_ms = saved.max_latency_ms;
        if metrics.completed_requests() > 0 {
            metrics.min_latency_ms = saved.min_latency_ms;
        }
    }

    async fn persist(&self, description: &str, checkpoint: bool) -> Result<SnapshotInfo> {
        let manager = self
            .state
            .clone()
            .ok_or_else(|| Error::NotInitialized("state persistence".into()))?;
        let state = self.capture_state();
        let description = description.to_string();
        let info = tokio::task::spawn_blocking(move || {
            if checkpoint {
                manager.create_checkpoint(&state, &description)
            } else {
                manager.save_state(&state, &description)
            }
        })
        .await
        .map_err(|e| Error::invalid_state(format!("snapshot task failed: {}", e)))??;
        Ok(info)
    }
}

/// Builds a [`ProductionEngine`].
pub struct ProductionEngineBuilder {
    config: ProductionConfig,
    backend: Option<Arc<dyn ComputeBackend>>,
    speculative_models: Option<(Arc<dyn DraftModel>, Arc<dyn TargetModel>)>,
}

impl ProductionEngineBuilder {
    /// Start from `config`.
    pub fn new(config: ProductionConfig) -> Self {
        Self {
            config,
            backend: None,
            speculative_models: None,
        }
    }

    /// Compute backend; defaults to [`SyntheticBackend`].
    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Draft and target models for speculative decoding.
    pub fn with_speculative_models(
        mut self,
        draft: Arc<dyn DraftModel>,
        target: Arc<dyn TargetModel>,
    ) -> Self {
        self.speculative_models = Some((draft, target));
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<ProductionEngine> {
        self.config
            .validate()
            .map_err(|e| Error::config(e.to_string()))?;
        let config = self.config;

        if config.metrics.enabled {
            if let Err(e) = tristream_metrics::ensure_metrics() {
                warn!("Metrics unavailable: {}", e);
            }
        }

        let (backend, models) = match self.backend {
            Some(backend) => (backend, self.speculative_models),
            None => {
                let synthetic = Arc::new(SyntheticBackend::new(SyntheticConfig::default()));
                let models = self.speculative_models.or_else(|| {
                    let draft: Arc<dyn DraftModel> = Arc::new(SyntheticDraft::new(
                        SyntheticConfig::default(),
                        SYNTHETIC_DRAFT_MISS_EVERY,
                    ));
                    let target: Arc<dyn TargetModel> = synthetic.clone();
                    Some((draft, target))
                });
                (synthetic as Arc<dyn ComputeBackend>, models)
            }
        };
        let backend_name = backend.name().to_string();

        let speculative = if config.enable_speculative {
            let (draft, target) = models.ok_or_else(|| {
                Error::config("speculative decoding needs draft and target models")
            })?;
            Some(Arc::new(SpeculativeEngine::new(
                config.speculative.clone(),
                draft,
                target,
            )?))
        } else {
            None
        };
        let backend: Arc<dyn ComputeBackend> = match &speculative {
            Some(engine) => Arc::new(SpeculativeBackend::new(backend, engine.clone())),
            None => backend,
        };

        let batch_config = config.effective_batch_config();
        let kv = Arc::new(KvCacheManager::from_config(&batch_config));
        let batcher = ContinuousBatcher::new(batch_config, backend, kv.clone())
            .with_streaming(config.enable_streaming, config.stream_capacity);
        let allocator = config
            .enable_memory_pool
            .then(|| StreamAllocator::new(&config.pool));
        let state = config
            .enable_state_persistence
            .then(|| Arc::new(StateManager::new(config.state.clone())));

        info!(
            "Built production engine: backend={}, batching={}, streaming={}, speculative={}, persistence={}",
            backend_name,
            config.enable_batching,
            config.enable_streaming,
            speculative.is_some(),
            state.is_some()
        );

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(ProductionEngine {
            inner: Arc::new(Inner {
                config,
                backend_name,
                allocator,
                kv,
                batcher,
                speculative,
                state,
                metrics: RwLock::new(ProductionMetrics::default()),
                steps: Default::default(),
                staging: Mutex::new(Staging::default()),
                started_at: Mutex::new(None),
                outbox,
            }),
            status: Mutex::new(EngineStatus::Created),
            outbox_rx: tokio::sync::Mutex::new(outbox_rx),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            recovered: Mutex::new(None),
        })
    }
}

/// The serving engine.
pub struct ProductionEngine {
    inner: Arc<Inner>,
    status: Mutex<EngineStatus>,
    outbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InferenceResponse>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovered: Mutex<Option<CognitiveState>>,
}

impl ProductionEngine {
    /// Builder for `config`.
    pub fn builder(config: ProductionConfig) -> ProductionEngineBuilder {
        ProductionEngineBuilder::new(config)
    }

    /// Engine with the synthetic backend.
    pub fn new(config: ProductionConfig) -> Result<Self> {
        ProductionEngineBuilder::new(config).build()
    }

    /// Configuration.
    pub fn config(&self) -> &ProductionConfig {
        &self.inner.config
    }

    /// Lifecycle state.
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    /// KV cache manager.
    pub fn kv_cache(&self) -> &Arc<KvCacheManager> {
        &self.inner.kv
    }

    /// Continuous batcher.
    pub fn batcher(&self) -> &ContinuousBatcher {
        &self.inner.batcher
    }

    /// Per-stream pools, when enabled.
    pub fn allocator(&self) -> Option<&StreamAllocator> {
        self.inner.allocator.as_ref()
    }

    /// Speculative engine, when enabled.
    pub fn speculative(&self) -> Option<&Arc<SpeculativeEngine>> {
        self.inner.speculative.as_ref()
    }

    /// State manager, when persistence is enabled.
    pub fn state_manager(&self) -> Option<&Arc<StateManager>> {
        self.inner.state.as_ref()
    }

    /// State restored by `initialize`, if any.
    pub fn recovered_state(&self) -> Option<CognitiveState> {
        self.recovered.lock().clone()
    }

    /// Highest caller step seen on `stream`.
    pub fn stream_step(&self, stream: StreamId) -> u64 {
        self.inner.steps[stream.index()].load(Ordering::Relaxed)
    }

    fn check_status(&self, allowed: &[EngineStatus], operation: &str) -> Result<()> {
        let status = self.status();
        if status == EngineStatus::Closed {
            return Err(Error::AlreadyClosed("production engine".into()));
        }
        if !allowed.contains(&status) {
            return Err(Error::invalid_state(format!(
                "cannot {} engine while {}",
                operation, status
            )));
        }
        Ok(())
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
    }

    /// Prepare storage and restore the configured snapshot.
    pub async fn initialize(&self) -> Result<()> {
        self.check_status(&[EngineStatus::Created], "initialize")?;

        if let Some(manager) = &self.inner.state {
            let manager = manager.clone();
            let recovered = tokio::task::spawn_blocking(move || -> Result<Option<CognitiveState>> {
                manager.initialize()?;
                Ok(manager.recover()?)
            })
            .await
            .map_err(|e| Error::invalid_state(format!("state recovery task failed: {}", e)))??;

            if let Some(state) = recovered {
                self.inner.restore(&state);
                info!(
                    "Recovered engine state '{}' from {}",
                    state.description, state.timestamp
                );
                *self.recovered.lock() = Some(state);
            }
        }

        self.set_status(EngineStatus::Initialized);
        info!("Production engine initialized");
        Ok(())
    }

    /// Start the batcher and background tasks. Requires a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.check_status(&[EngineStatus::Initialized], "start")?;
        self.inner.batcher.start()?;
        *self.inner.started_at.lock() = Some(Instant::now());

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(completion_loop(
            self.inner.clone(),
            self.shutdown_tx.subscribe(),
        )));
        if self.inner.config.metrics.enabled {
            tasks.push(tokio::spawn(metrics_loop(
                self.inner.clone(),
                self.shutdown_tx.subscribe(),
                self.inner.config.metrics.interval(),
            )));
        }
        if self.inner.state.is_some() {
            if let Some(period) = self.inner.config.state.auto_save_interval() {
                tasks.push(tokio::spawn(persist_loop(
                    self.inner.clone(),
                    self.shutdown_tx.subscribe(),
                    period,
                    false,
                )));
            }
            if let Some(period) = self.inner.config.state.checkpoint_interval() {
                tasks.push(tokio::spawn(persist_loop(
                    self.inner.clone(),
                    self.shutdown_tx.subscribe(),
                    period,
                    true,
                )));
            }
        }
        drop(tasks);

        self.set_status(EngineStatus::Running);
        info!("Production engine started");
        Ok(())
    }

    /// Submit a request.
    pub async fn submit(&self, request: InferenceRequest) -> Result<SequenceHandle> {
        match self.status() {
            EngineStatus::Running => {}
            EngineStatus::Created | EngineStatus::Initialized => {
                return Err(Error::NotInitialized("production engine".into()));
            }
            EngineStatus::Stopped | EngineStatus::Closed => {
                return Err(Error::AlreadyClosed("production engine".into()));
            }
        }
        let stream = request.stream;
        self.inner.steps[stream.index()].fetch_max(request.step, Ordering::Relaxed);

        let staged = if request.is_empty() {
            None
        } else {
            self.inner.stage_prompt(&request)?
        };

        let handle = match self.inner.batcher.submit(request).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(tensor) = staged {
                    self.inner.free_staged(stream, tensor);
                }
                return Err(e);
            }
        };

        self.inner.metrics.write().record_submit(stream);
        if let Some(tensor) = staged {
            self.inner.track_staged(handle.id(), stream, tensor);
        }
        Ok(handle)
    }

    /// Cancel a sequence. Returns `false` if it already finished.
    pub fn cancel(&self, id: SequenceId) -> bool {
        self.inner.batcher.cancel(id)
    }

    /// Next completed response, in completion order.
    pub async fn next_completed(&self) -> Option<InferenceResponse> {
        self.outbox_rx.lock().await.recv().await
    }

    /// Next completed response if one is ready.
    pub fn try_next_completed(&self) -> Option<InferenceResponse> {
        self.outbox_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Write a snapshot now.
    pub async fn save_state(&self, description: &str) -> Result<SnapshotInfo> {
        self.inner.persist(description, false).await
    }

    /// Write a checkpoint now.
    pub async fn create_checkpoint(&self, description: &str) -> Result<SnapshotInfo> {
        self.inner.persist(description, true).await
    }

    /// Current engine state, as it would be saved.
    pub fn capture_state(&self) -> CognitiveState {
        self.inner.capture_state()
    }

    /// Request metrics.
    pub fn metrics(&self) -> ProductionMetrics {
        self.inner.snapshot_metrics()
    }

    /// Batcher counters.
    pub fn batcher_stats(&self) -> BatcherStats {
        self.inner.batcher.stats()
    }

    /// Per-component health.
    pub fn health(&self) -> Health {
        let status = self.status();
        let inner = &self.inner;
        let mut components = BTreeMap::new();

        let pools = match &inner.allocator {
            Some(allocator) => {
                let stats = allocator.stats();
                let in_use: u64 = stats.iter().map(|s| s.current_usage).sum();
                let failures: u64 = stats.iter().map(|s| s.oom_count).sum();
                ComponentHealth::new(
                    status != EngineStatus::Closed,
                    format!("{} bytes in use, {} failed allocations", in_use, failures),
                )
            }
            None => ComponentHealth::disabled(),
        };
        components.insert("pools".to_string(), pools);

        let batcher = inner.batcher.stats();
        components.insert(
            "batcher".to_string(),
            ComponentHealth::new(
                status != EngineStatus::Running || inner.batcher.is_running(),
                format!(
                    "{} pending, {} running, kv {}/{}",
                    batcher.pending, batcher.running, batcher.kv_used, batcher.kv_capacity
                ),
            ),
        );

        let speculative = match &inner.speculative {
            Some(spec) => {
                let stats = spec.stats();
                ComponentHealth::new(
                    true,
                    format!(
                        "{} rounds, acceptance {:.2}",
                        stats.iterations,
                        stats.acceptance_rate()
                    ),
                )
            }
            None => ComponentHealth::disabled(),
        };
        components.insert("speculative".to_string(), speculative);

        let state = match &inner.state {
            Some(manager) => ComponentHealth::new(
                manager.is_initialized() || status == EngineStatus::Created,
                format!(
                    "{} snapshots in {}",
                    manager.list_snapshots().len(),
                    manager.storage_dir().display()
                ),
            ),
            None => ComponentHealth::disabled(),
        };
        components.insert("state".to_string(), state);

        let streaming = if inner.config.enable_streaming {
            ComponentHealth::new(
                true,
                format!("capacity {}", inner.config.stream_capacity),
            )
        } else {
            ComponentHealth::disabled()
        };
        components.insert("streaming".to_string(), streaming);

        let initialized = !matches!(status, EngineStatus::Created | EngineStatus::Closed);
        Health {
            healthy: initialized && components.values().all(|c| c.healthy),
            initialized,
            running: status == EngineStatus::Running,
            status,
            uptime: inner.uptime(),
            components,
        }
    }

    /// Stop accepting work, cancel live sequences, stop background tasks
    /// and write a "shutdown" checkpoint.
    pub async fn stop(&self) -> Result<()> {
        self.check_status(&[EngineStatus::Running], "stop")?;
        self.set_status(EngineStatus::Stopped);
        info!("Stopping production engine");

        self.inner.batcher.shutdown().await;
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Engine task ended abnormally: {}", e);
            }
        }

        if self.inner.state.is_some() {
            let info = self.inner.persist("shutdown", true).await?;
            info!("Wrote shutdown checkpoint {}", info.id);
        }

        let metrics = self.metrics();
        info!(
            "Production engine stopped: {} requests, {} tokens, {:.1} tokens/s",
            metrics.total_requests, metrics.total_tokens, metrics.tokens_per_second
        );
        Ok(())
    }

    /// Release the memory pools. Stops the engine first if it is running.
    /// Closing twice is an error.
    pub async fn close(&self) -> Result<()> {
        if self.status() == EngineStatus::Running {
            if let Err(e) = self.stop().await {
                warn!("Stop during close failed: {}", e);
            }
        }
        {
            let mut status = self.status.lock();
            if *status == EngineStatus::Closed {
                return Err(Error::AlreadyClosed("production engine".into()));
            }
            *status = EngineStatus::Closed;
        }
        if let Some(allocator) = &self.inner.allocator {
            allocator.close()?;
        }
        info!("Production engine closed");
        Ok(())
    }
}

impl Drop for ProductionEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for ProductionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProductionEngine")
            .field("status", &self.status())
            .field("backend", &self.inner.backend_name)
            .field("speculative", &self.inner.speculative.is_some())
            .field("persistence", &self.inner.state.is_some())
            .finish()
    }
}

async fn completion_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            response = inner.batcher.next_completed() => match response {
                Some(response) => inner.on_completed(response),
                None => return,
            },
        }
    }
    // The batcher is already shut down; collect what it cancelled.
    while let Some(response) = inner.batcher.try_next_completed() {
        inner.on_completed(response);
    }
    debug!("Completion loop stopped");
}

async fn metrics_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => inner.publish_gauges(),
        }
    }
    debug!("Metrics loop stopped");
}

async fn persist_loop(
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    checkpoint: bool,
) {
    let description = if checkpoint { "periodic checkpoint" } else { "auto-save" };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.persist(description, checkpoint).await {
                    warn!("{} failed: {}", description, e);
                }
            }
        }
    }
    debug!("{} loop stopped", description);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tristream_config::RecoveryMode;

    fn config(dir: &TempDir) -> ProductionConfig {
        let mut config = ProductionConfig::new("synthetic").with_state_dir(dir.path());
        config.batch.max_wait_time_ms = 2;
        config.state.checkpoint_interval_ms = 0;
        config.metrics.interval_ms = 10;
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
    async fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let engine = ProductionEngine::new(config(&dir)).unwrap();
        assert_eq!(engine.status(), EngineStatus::Created);
        assert!(engine.start().is_err());
        assert!(matches!(
            engine.submit(request(StreamId::Alpha, 2)).await,
            Err(Error::NotInitialized(_))
        ));

        engine.initialize().await.unwrap();
        engine.start().unwrap();
        assert_eq!(engine.status(), EngineStatus::Running);

        let response = engine
            .submit(request(StreamId::Alpha, 6))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(response.tokens.len(), 6);
        assert_eq!(response.finish_reason, FinishReason::Length);

        engine.stop().await.unwrap();
        engine.close().await.unwrap();
        assert!(matches!(
            engine.close().await,
            Err(Error::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_matches_response() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir)).await;

        let mut handle = engine.submit(request(StreamId::Beta, 5)).await.unwrap();
        let stream = handle.take_stream().unwrap();
        let streamed = stream.collect().await.unwrap();
        let response = handle.wait().await.unwrap();
        assert_eq!(streamed.tokens, response.tokens);
        assert_eq!(streamed.output, response.output);

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_without_streaming() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir).without_streaming()).await;
        let handle = engine.submit(request(StreamId::Gamma, 3)).await.unwrap();
        assert!(handle.stream().is_none());
        assert_eq!(handle.wait().await.unwrap().tokens.len(), 3);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_next_completed_and_metrics() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir)).await;
        assert_eq!(engine.metrics().min_latency_ms, u64::MAX);

        for stream in StreamId::ALL {
            engine.submit(request(stream, 4)).await.unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let response = tokio::time::timeout(Duration::from_secs(5), engine.next_completed())
                .await
                .unwrap()
                .unwrap();
            seen.push(response.stream);
        }
        seen.sort();
        assert_eq!(seen, StreamId::ALL.to_vec());

        let metrics = engine.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 3);
        assert_eq!(metrics.total_tokens, 12);
        assert_eq!(metrics.total_prompt_tokens, 12);
        assert!(metrics.min_latency_ms <= metrics.max_latency_ms);
        for stream in &metrics.streams {
            assert_eq!(stream.requests, 1);
            assert_eq!(stream.tokens, 4);
        }

        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_request() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir)).await;
        let response = engine
            .submit(InferenceRequest::new(StreamId::Alpha, vec![], 8))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::Empty);
        assert!(response.tokens.is_empty());
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_staging_released() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir)).await;
        let handle = engine.submit(request(StreamId::Alpha, 2)).await.unwrap();
        handle.wait().await.unwrap();
        // The completion task runs independently of the handle.
        engine.next_completed().await.unwrap();

        let allocator = engine.allocator().unwrap();
        assert_eq!(allocator.tensor_counts(), [0; NUM_STREAMS]);
        assert_eq!(allocator.stats()[0].current_usage, 0);
        assert!(allocator.stats()[0].total_allocated >= 16);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_checkpoint_and_recovery() {
        let dir = TempDir::new().unwrap();
        let before = {
            let engine = running(config(&dir)).await;
            engine
                .submit(request(StreamId::Gamma, 3).with_step(41))
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
            engine.next_completed().await.unwrap();
            engine.stop().await.unwrap();

            let latest = engine.state_manager().unwrap().latest_checkpoint().unwrap();
            assert_eq!(latest.description, "shutdown");
            let before = engine.metrics();
            engine.close().await.unwrap();
            before
        };

        let engine = ProductionEngine::new(config(&dir)).unwrap();
        engine.initialize().await.unwrap();
        let recovered = engine.recovered_state().unwrap();
        assert_eq!(recovered.description, "shutdown");
        assert_eq!(engine.stream_step(StreamId::Gamma), 41);

        let after = engine.metrics();
        assert_eq!(after.total_tokens, 3);
        assert_eq!(after.total_requests, before.total_requests);
        assert_eq!(after.successful_requests, before.successful_requests);
        assert_eq!(after.total_prompt_tokens, before.total_prompt_tokens);
        assert_eq!(after.avg_latency_ms, before.avg_latency_ms);
        assert_eq!(after.min_latency_ms, before.min_latency_ms);
        assert_eq!(after.max_latency_ms, before.max_latency_ms);
        assert_eq!(after.streams, before.streams);
    }

    #[tokio::test]
    async fn test_recovered_averages_keep_running() {
        let dir = TempDir::new().unwrap();
        let mut seeded = CognitiveState::new("seeded");
        seeded.metrics.total_requests = 105;
        seeded.metrics.successful_requests = 100;
        seeded.metrics.cancelled_requests = 5;
        seeded.metrics.avg_latency_ms = 40.0;
        seeded.metrics.min_latency_ms = 10;
        seeded.metrics.max_latency_ms = 90;
        let alpha = &mut seeded.streams[StreamId::Alpha.index()];
        alpha.submitted = 105;
        alpha.requests = 105;
        alpha.avg_latency_ms = 40.0;
        {
            let manager = tristream_state::StateManager::new(config(&dir).state);
            manager.initialize().unwrap();
            manager.save_state(&seeded, "seeded").unwrap();
        }

        let engine = ProductionEngine::new(config(&dir)).unwrap();
        engine.initialize().await.unwrap();
        let metrics = engine.metrics();
        assert_eq!(metrics.successful_requests, 100);
        assert_eq!(metrics.cancelled_requests, 5);
        assert_eq!(metrics.avg_latency_ms, 40.0);
        assert_eq!(metrics.min_latency_ms, 10);
        assert_eq!(metrics.streams[StreamId::Alpha.index()].requests, 105);
        assert_eq!(metrics.streams[StreamId::Alpha.index()].avg_latency_ms, 40.0);

        engine.start().unwrap();
        engine
            .submit(request(StreamId::Alpha, 2))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        engine.stop().await.unwrap();

        // One fast request barely moves a mean built from 105 samples.
        let metrics = engine.metrics();
        assert_eq!(metrics.successful_requests, 101);
        assert!(metrics.avg_latency_ms > 35.0);
        assert!(metrics.streams[StreamId::Alpha.index()].avg_latency_ms > 35.0);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let dir = TempDir::new().unwrap();
        let engine = ProductionEngine::new(config(&dir).without_persistence()).unwrap();
        engine.initialize().await.unwrap();
        assert!(matches!(
            engine.submit(request(StreamId::Beta, 2)).await,
            Err(Error::NotInitialized(_))
        ));

        engine.start().unwrap();
        engine.stop().await.unwrap();
        assert!(matches!(
            engine.submit(request(StreamId::Beta, 2)).await,
            Err(Error::AlreadyClosed(_))
        ));

        engine.close().await.unwrap();
        assert!(matches!(
            engine.submit(request(StreamId::Beta, 2)).await,
            Err(Error::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_recovery_disabled() {
        let dir = TempDir::new().unwrap();
        {
            let engine = running(config(&dir)).await;
            engine.stop().await.unwrap();
        }
        let mut cfg = config(&dir);
        cfg.state.recovery_mode = RecoveryMode::None;
        let engine = ProductionEngine::new(cfg).unwrap();
        engine.initialize().await.unwrap();
        assert!(engine.recovered_state().is_none());
    }

    #[tokio::test]
    async fn test_without_persistence() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir).without_persistence()).await;
        assert!(engine.state_manager().is_none());
        assert!(matches!(
            engine.save_state("manual").await,
            Err(Error::NotInitialized(_))
        ));
        engine.stop().await.unwrap();
        assert!(!dir.path().join(tristream_state::INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn test_auto_save() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir).with_auto_save(Duration::from_millis(20))).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let snapshots = engine.state_manager().unwrap().list_snapshots();
        assert!(snapshots
            .iter()
            .any(|s| !s.is_checkpoint && s.description == "auto-save"));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_speculative_engine() {
        let dir = TempDir::new().unwrap();
        let engine = running(config(&dir).with_draft_model("synthetic-draft")).await;
        assert!(engine.speculative().is_some());

        let response = engine
            .submit(request(StreamId::Alpha, 12))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(response.tokens.len(), 12);
        assert!(engine.speculative().unwrap().stats().iterations > 0);

        let state = engine.capture_state();
        assert!(state.speculative.enabled);
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let engine = ProductionEngine::new(config(&dir)).unwrap();
        let health = engine.health();
        assert!(!health.healthy);
        assert!(!health.initialized);

        engine.initialize().await.unwrap();
        assert!(engine.health().healthy);
        assert!(!engine.health().running);
        engine.start().unwrap();

        let health = engine.health();
        assert!(health.healthy);
        assert!(health.running);
        assert_eq!(health.status, EngineStatus::Running);
        let names: Vec<_> = health.components.keys().cloned().collect();
        assert_eq!(
            names,
            vec!["batcher", "pools", "speculative", "state", "streaming"]
        );
        assert_eq!(health.components["speculative"].message, "disabled");

        engine.close().await.unwrap();
        assert!(!engine.health().healthy);
    }

    #[test]
    fn test_metrics_averages() {
        let mut metrics = ProductionMetrics::default();
        let mut response = InferenceResponse {
            request_id: "r".into(),
            sequence_id: SequenceId::new(1),
            stream: StreamId::Beta,
            step: 0,
            output: String::new(),
            tokens: vec![1, 2],
            prompt_tokens: 3,
            finish_reason: FinishReason::Stop,
            latency_ms: 10,
            tokens_per_sec: 0.0,
            metadata: HashMap::new(),
        };
        metrics.record_completion(&response);
        response.latency_ms = 30;
        response.finish_reason = FinishReason::Cancelled;
        metrics.record_completion(&response);

        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.cancelled_requests, 1);
        assert_eq!(metrics.min_latency_ms, 10);
        assert_eq!(metrics.max_latency_ms, 30);
        assert!((metrics.avg_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(metrics.streams[1].completed, 2);
        assert_eq!(metrics.streams[1].tokens, 4);
    }
}
