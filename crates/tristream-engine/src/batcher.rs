//! Continuous batching.
//!
//! Submitted sequences enter a bounded admission queue. A background task
//! drains it into the pending set and, on every tick, forms at most one
//! prefill batch (sequences without generated tokens) and one decode batch
//! (sequences already generating). Each batch runs on the compute backend
//! through `spawn_blocking`; its tokens are written to the member sequences'
//! token streams and their KV reservations grown.
//!
//! A failed step is attributed to the sequences in that batch: their
//! streams are closed with the error and the loop keeps running.
//!
//! Completion is delivered twice, at most once each: through the
//! sequence's own [`SequenceHandle`] and through the shared outbox read by
//! [`ContinuousBatcher::next_completed`].

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use tristream_config::BatchConfig;
use tristream_core::{
    Error, FinishReason, InferenceRequest, InferenceResponse, Result, SequenceId, StreamId, Token,
};
use tristream_metrics::Timer;

use crate::backend::{BatchOutput, ComputeBackend};
use crate::batch::{Batch, BatchEntry, BatchPhase};
use crate::kv_cache::KvCacheManager;
use crate::sequence::{Sequence, SequenceState};
use crate::streaming::{StreamingResponse, TokenStream, DEFAULT_STREAM_CAPACITY};

/// Batcher counters and queue sizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatcherStats {
    /// Sequences accepted by `submit`
    pub sequence_count: u64,
    /// Batches executed
    pub batch_count: u64,
    /// Prefill batches executed
    pub prefill_batches: u64,
    /// Decode batches executed
    pub decode_batches: u64,
    /// Sequences completed normally (no-ops included)
    pub completed: u64,
    /// Sequences cancelled or evicted
    pub cancelled: u64,
    /// Sequences evicted from the KV cache
    pub evicted: u64,
    /// Sequences completed without generating
    pub noop_completions: u64,
    /// Batch steps that failed in the backend
    pub failed_batches: u64,
    /// Tokens written to sequences
    pub tokens_generated: u64,
    /// Sequences waiting for prefill
    pub pending: usize,
    /// Sequences generating
    pub running: usize,
    /// KV tokens reserved
    pub kv_used: usize,
    /// KV capacity in tokens
    pub kv_capacity: usize,
    /// KV slots
    pub kv_slots: usize,
}

/// Caller side of a submitted sequence.
pub struct SequenceHandle {
    id: SequenceId,
    stream_id: StreamId,
    request_id: String,
    stream: Option<StreamingResponse>,
    completion: oneshot::Receiver<InferenceResponse>,
}

impl SequenceHandle {
    /// Sequence id.
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Stream the sequence runs on.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Caller request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Token stream, when streaming is enabled.
    pub fn stream(&self) -> Option<&StreamingResponse> {
        self.stream.as_ref()
    }

    /// Take ownership of the token stream.
    pub fn take_stream(&mut self) -> Option<StreamingResponse> {
        self.stream.take()
    }

    /// Wait for the final response.
    pub async fn wait(self) -> Result<InferenceResponse> {
        self.completion.await.map_err(|_| Error::Shutdown)
    }

    /// Wait for the final response, at most `timeout`.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<InferenceResponse> {
        let id = self.id;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::timeout(format!("completion of {}", id), timeout))?
    }
}

impl fmt::Debug for SequenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceHandle")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}

struct Tracked {
    sequence: Sequence,
    stream: Option<TokenStream>,
    completion: Option<oneshot::Sender<InferenceResponse>>,
    order: u64,
}

#[derive(Default)]
struct State {
    sequences: HashMap<SequenceId, Tracked>,
    pending: Vec<SequenceId>,
    running: VecDeque<SequenceId>,
    in_flight: HashSet<SequenceId>,
    stats: BatcherStats,
}

struct Shared {
    config: BatchConfig,
    streaming: bool,
    stream_capacity: usize,
    backend: Arc<dyn ComputeBackend>,
    kv: Arc<KvCacheManager>,
    state: Mutex<State>,
    next_sequence: AtomicU64,
    next_batch: AtomicU64,
    outbox: mpsc::UnboundedSender<InferenceResponse>,
    stopping: AtomicBool,
    shutdown: Notify,
}

/// Continuous batcher.
pub struct ContinuousBatcher {
    shared: Arc<Shared>,
    submit_tx: mpsc::Sender<SequenceId>,
    submit_rx: Mutex<Option<mpsc::Receiver<SequenceId>>>,
    outbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<InferenceResponse>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ContinuousBatcher {
    /// Create a batcher. Call [`start`](Self::start) to run it.
    pub fn new(
        config: BatchConfig,
        backend: Arc<dyn ComputeBackend>,
        kv: Arc<KvCacheManager>,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(config.submit_queue_capacity.max(1));
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                streaming: true,
                stream_capacity: DEFAULT_STREAM_CAPACITY,
                backend,
                kv,
                state: Mutex::new(State::default()),
                next_sequence: AtomicU64::new(1),
                next_batch: AtomicU64::new(1),
                outbox,
                stopping: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            outbox_rx: tokio::sync::Mutex::new(outbox_rx),
            task: Mutex::new(None),
        }
    }

    /// Configure token streaming. Must be called before `start`.
    pub fn with_streaming(mut self, enabled: bool, capacity: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.streaming = enabled;
            shared.stream_capacity = capacity.max(1);
        }
        self
    }

    /// Batch configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.shared.config
    }

    /// KV cache manager.
    pub fn kv_cache(&self) -> &Arc<KvCacheManager> {
        &self.shared.kv
    }

    /// Spawn the scheduling loop. Requires a Tokio runtime.
    pub fn start(&self) -> Result<()> {
        let rx = self
            .submit_rx
            .lock()
            .take()
            .ok_or_else(|| Error::invalid_state("batcher already started"))?;
        let shared = self.shared.clone();
        *self.task.lock() = Some(tokio::spawn(run_loop(shared, rx)));
        info!(
            "Started continuous batcher: max_batch_size={}, max_wait={}ms",
            self.shared.config.max_batch_size, self.shared.config.max_wait_time_ms
        );
        Ok(())
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Submit a request, waiting for admission queue space.
    pub async fn submit(&self, request: InferenceRequest) -> Result<SequenceHandle> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if request.is_empty() {
            return Ok(self.shared.complete_noop(request));
        }
        let permit = self
            .submit_tx
            .reserve()
            .await
            .map_err(|_| Error::Shutdown)?;
        let (handle, id) = self.shared.register(request);
        permit.send(id);
        Ok(handle)
    }

    /// Submit without waiting; fails with `CapacityExceeded` if the
    /// admission queue is full.
    pub fn try_submit(&self, request: InferenceRequest) -> Result<SequenceHandle> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if request.is_empty() {
            return Ok(self.shared.complete_noop(request));
        }
        let permit = self.submit_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::CapacityExceeded {
                requested: 1,
                capacity: self.shared.config.submit_queue_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => Error::Shutdown,
        })?;
        let (handle, id) = self.shared.register(request);
        permit.send(id);
        Ok(handle)
    }

    /// Cancel a sequence. Returns `false` if it already finished.
    pub fn cancel(&self, id: SequenceId) -> bool {
        let mut state = self.shared.state.lock();
        if !state.sequences.contains_key(&id) {
            return false;
        }
        debug!("Cancelling {}", id);
        self.shared.finish(
            &mut state,
            id,
            FinishReason::Cancelled,
            Some(Error::cancelled("cancelled by caller")),
        );
        true
    }

    /// State of a live sequence.
    pub fn sequence_state(&self, id: SequenceId) -> Option<SequenceState> {
        self.shared
            .state
            .lock()
            .sequences
            .get(&id)
            .map(|t| t.sequence.state())
    }

    /// Next completed response, in completion order.
    pub async fn next_completed(&self) -> Option<InferenceResponse> {
        self.outbox_rx.lock().await.recv().await
    }

    /// Next completed response if one is ready.
    pub fn try_next_completed(&self) -> Option<InferenceResponse> {
        self.outbox_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Counters and queue sizes.
    pub fn stats(&self) -> BatcherStats {
        let state = self.shared.state.lock();
        let kv = self.shared.kv.stats();
        BatcherStats {
            pending: state.pending.len(),
            running: state.running.len() + state.in_flight.len(),
            kv_used: kv.used,
            kv_capacity: kv.capacity,
            kv_slots: kv.slot_count,
            ..state.stats.clone()
        }
    }

    /// Stop the loop and cancel everything still queued or running.
    pub async fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Batcher loop ended abnormally: {}", e);
            }
        }

        let mut state = self.shared.state.lock();
        let live: Vec<SequenceId> = state.sequences.keys().copied().collect();
        for id in &live {
            self.shared
                .finish(&mut state, *id, FinishReason::Cancelled, Some(Error::Shutdown));
        }
        info!("Continuous batcher stopped, {} sequences cancelled", live.len());
    }
}

impl fmt::Debug for ContinuousBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousBatcher")
            .field("config", &self.shared.config)
            .field("backend", &self.shared.backend.name())
            .finish()
    }
}

impl Shared {
    fn stream_priority(&self, stream: StreamId) -> u32 {
        self.config.stream_priorities[stream.index()]
    }

    fn new_sequence(&self, request: InferenceRequest) -> (Tracked, SequenceHandle, u64) {
        let order = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = SequenceId::new(order);
        let priority = self.stream_priority(request.stream);
        let request_id = request.request_id.clone();
        let step = request.step;
        let metadata = request.metadata.clone();
        let sequence = Sequence::new(id, request, priority);

        let capacity = self.stream_capacity.max(sequence.max_new_tokens());
        let token_stream = TokenStream::new(sequence.stream(), id, capacity);
        let response = self.streaming.then(|| {
            StreamingResponse::new(
                request_id.clone(),
                token_stream.clone(),
                sequence.prompt_len(),
                sequence.max_new_tokens(),
            )
            .with_context(step, metadata)
        });

        let (tx, rx) = oneshot::channel();
        let handle = SequenceHandle {
            id,
            stream_id: sequence.stream(),
            request_id,
            stream: response,
            completion: rx,
        };
        let tracked = Tracked {
            sequence,
            stream: self.streaming.then_some(token_stream),
            completion: Some(tx),
            order,
        };
        (tracked, handle, order)
    }

    fn register(&self, request: InferenceRequest) -> (SequenceHandle, SequenceId) {
        let (tracked, handle, _) = self.new_sequence(request);
        let id = handle.id;
        let mut state = self.state.lock();
        state.stats.sequence_count += 1;
        state.sequences.insert(id, tracked);
        (handle, id)
    }

    fn complete_noop(&self, request: InferenceRequest) -> SequenceHandle {
        let (tracked, handle, _) = self.new_sequence(request);
        let id = handle.id;
        debug!("{} has nothing to generate, completing immediately", id);
        let mut state = self.state.lock();
        state.stats.sequence_count += 1;
        state.sequences.insert(id, tracked);
        self.finish(&mut state, id, FinishReason::Empty, None);
        handle
    }

    /// Retire `id`: transition, release its KV slot, close its stream and
    /// deliver the response. No-op if `id` is not live.
    fn finish(
        &self,
        state: &mut State,
        id: SequenceId,
        reason: FinishReason,
        error: Option<Error>,
    ) {
        let Some(mut tracked) = state.sequences.remove(&id) else {
            return;
        };
        state.pending.retain(|s| *s != id);
        state.running.retain(|s| *s != id);
        state.in_flight.remove(&id);

        let transition = match error {
            None => tracked.sequence.complete(reason),
            Some(_) => tracked.sequence.cancel(reason),
        };
        if let Err(e) = transition {
            warn!("Finishing {}: {}", id, e);
        }
        if let Some(slot) = tracked.sequence.take_kv_slot() {
            self.kv.release(slot);
        }
        if let Some(stream) = &tracked.stream {
            match error {
                Some(e) => stream.close_with_error(e),
                None => stream.close(),
            }
        }

        match reason {
            FinishReason::Empty => {
                state.stats.noop_completions += 1;
                state.stats.completed += 1;
            }
            FinishReason::Stop | FinishReason::Length => state.stats.completed += 1,
            FinishReason::Evicted => {
                state.stats.evicted += 1;
                state.stats.cancelled += 1;
            }
            FinishReason::Cancelled => state.stats.cancelled += 1,
            FinishReason::Error => {}
        }

        let response = tracked.sequence.to_response();
        let stream = response.stream.as_str();
        let status = if response.is_success() { "success" } else { reason.as_str() };
        tristream_metrics::inc_requests(stream, status);
        tristream_metrics::observe_request_latency(stream, response.latency_ms as f64 / 1000.0);

        if let Some(tx) = tracked.completion.take() {
            let _ = tx.send(response.clone());
        }
        let _ = self.outbox.send(response);
    }

    fn admit(&self, id: SequenceId) {
        let mut state = self.state.lock();
        if state.sequences.contains_key(&id) {
            state.pending.push(id);
        }
    }

    fn reap_evictions(&self, state: &mut State) {
        let capacity = self.kv.capacity();
        for id in self.kv.take_evicted() {
            warn!("{} evicted from the KV cache", id);
            self.finish(
                state,
                id,
                FinishReason::Evicted,
                Some(Error::CapacityExceeded {
                    requested: 0,
                    capacity,
                }),
            );
        }
    }

    fn next_batch_id(&self) -> u64 {
        self.next_batch.fetch_add(1, Ordering::Relaxed)
    }

    fn prefill_due(&self, state: &State) -> bool {
        if state.pending.is_empty() {
            return false;
        }
        if state.pending.len() >= self.config.preferred_batch_size {
            return true;
        }
        let max_wait = self.config.max_wait_time();
        state
            .pending
            .iter()
            .filter_map(|id| state.sequences.get(id))
            .any(|t| t.sequence.wait_time() >= max_wait)
    }

    fn form_prefill(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        if !self.prefill_due(&state) {
            return None;
        }

        let mut order: Vec<(Reverse<u32>, u64, SequenceId)> = state
            .pending
            .iter()
            .filter_map(|id| state.sequences.get(id).map(|t| (t, *id)))
            .map(|(t, id)| {
                let priority = if self.config.enable_priority {
                    t.sequence.priority()
                } else {
                    0
                };
                (Reverse(priority), t.order, id)
            })
            .collect();
        order.sort();

        let limit = self.config.max_batch_size.min(self.config.prefill_batch_size);
        let kv_capacity = self.kv.capacity();
        let mut entries = Vec::new();
        let mut tokens = 0usize;

        for (_, _, id) in order {
            if entries.len() >= limit {
                break;
            }
            let Some(prompt_len) = state.sequences.get(&id).map(|t| t.sequence.prompt_len())
            else {
                continue;
            };
            if prompt_len > kv_capacity {
                warn!("{} prompt of {} tokens exceeds the KV cache", id, prompt_len);
                self.finish(
                    &mut state,
                    id,
                    FinishReason::Error,
                    Some(Error::CapacityExceeded {
                        requested: prompt_len,
                        capacity: kv_capacity,
                    }),
                );
                continue;
            }
            if !entries.is_empty() && tokens + prompt_len > self.config.max_tokens_per_batch {
                break;
            }

            let slot = match self.kv.allocate(id, prompt_len) {
                Ok(slot) => slot,
                Err(e) => {
                    debug!("Deferring {}: {}", id, e);
                    break;
                }
            };
            let Some(tracked) = state.sequences.get_mut(&id) else {
                self.kv.release(slot);
                continue;
            };
            if let Err(e) = tracked.sequence.transition(SequenceState::Running) {
                warn!("{}", e);
                self.kv.release(slot);
                continue;
            }
            tracked.sequence.set_kv_slot(slot);
            entries.push(BatchEntry::from_sequence(&tracked.sequence, BatchPhase::Prefill));
            tokens += prompt_len;
        }

        for entry in &entries {
            state.pending.retain(|s| *s != entry.sequence);
            state.in_flight.insert(entry.sequence);
        }
        self.reap_evictions(&mut state);

        (!entries.is_empty()).then(|| Batch::new(self.next_batch_id(), BatchPhase::Prefill, entries))
    }

    fn form_decode(&self) -> Option<Batch> {
        let mut state = self.state.lock();
        let limit = self.config.max_batch_size.min(self.config.decode_batch_size);
        let mut entries = Vec::new();

        while entries.len() < limit {
            let Some(id) = state.running.pop_front() else {
                break;
            };
            let Some(tracked) = state.sequences.get(&id) else {
                continue;
            };
            let pinned = tracked
                .sequence
                .kv_slot()
                .is_some_and(|slot| self.kv.pin(slot));
            if !pinned {
                // Evicted between steps.
                continue;
            }
            entries.push(BatchEntry::from_sequence(&tracked.sequence, BatchPhase::Decode));
            state.in_flight.insert(id);
        }
        self.reap_evictions(&mut state);

        (!entries.is_empty()).then(|| Batch::new(self.next_batch_id(), BatchPhase::Decode, entries))
    }

    async fn execute(self: &Arc<Self>, batch: Batch) {
        let phase = batch.phase();
        let batch_id = batch.id();
        let members: Vec<SequenceId> = batch.sequence_ids().collect();
        let span = tristream_metrics::batch_span!(phase, members.len());

        let timer = Timer::start();
        let backend = self.backend.clone();
        let result = tokio::task::spawn_blocking(move || backend.run_batch(&batch))
            .instrument(span)
            .await
            .map_err(|e| Error::backend(format!("batch task failed: {}", e)))
            .and_then(|r| r);
        timer.observe_batch_step(phase.as_str());
        tristream_metrics::inc_batches(phase.as_str());

        let mut state = self.state.lock();
        state.stats.batch_count += 1;
        match phase {
            BatchPhase::Prefill => state.stats.prefill_batches += 1,
            BatchPhase::Decode => state.stats.decode_batches += 1,
        }

        match result {
            Ok(output) => self.apply(&mut state, &members, output),
            Err(e) => {
                error!("Batch {} ({}) failed: {}", batch_id, phase, e);
                state.stats.failed_batches += 1;
                for id in members {
                    self.finish(&mut state, id, FinishReason::Error, Some(e.clone()));
                }
            }
        }
        self.reap_evictions(&mut state);
    }

    fn apply(&self, state: &mut State, members: &[SequenceId], output: BatchOutput) {
        for &id in members {
            state.in_flight.remove(&id);
            let Some(tracked) = state.sequences.get_mut(&id) else {
                // Cancelled while the step ran.
                continue;
            };
            let Some(out) = output.get(id) else {
                let err = Error::backend(format!("no output for {}", id));
                self.finish(state, id, FinishReason::Error, Some(err));
                continue;
            };

            let mut finished = None;
            let mut written = 0u64;
            for generated in &out.tokens {
                if generated.is_eos {
                    finished = Some(FinishReason::Stop);
                    break;
                }
                let position = tracked.sequence.generated_len();
                tracked
                    .sequence
                    .push_token(generated.id, generated.logprob, &generated.text);
                written += 1;

                let last = tracked.sequence.remaining() == 0;
                if let Some(stream) = &tracked.stream {
                    let mut token = Token::new(
                        generated.id,
                        generated.text.clone(),
                        tracked.sequence.stream(),
                        id,
                        position,
                    )
                    .with_logprob(generated.logprob);
                    if last {
                        token = token.finalize();
                    }
                    if let Err(e) = stream.try_send(token) {
                        warn!("Dropping token for {}: {}", id, e);
                    }
                }
                if last {
                    finished = Some(FinishReason::Length);
                    break;
                }
            }

            let stream_name = tracked.sequence.stream().as_str();
            tristream_metrics::inc_tokens(stream_name, "generated", written);
            let token_count = tracked.sequence.token_count();
            let slot = tracked.sequence.kv_slot();
            state.stats.tokens_generated += written;

            if let Some(reason) = finished {
                self.finish(state, id, reason, None);
                continue;
            }

            let kept = match slot {
                Some(slot) => match self.kv.update(slot, token_count) {
                    Ok(()) => self.kv.unpin(slot),
                    Err(e) => {
                        debug!("{} lost its KV reservation: {}", id, e);
                        false
                    }
                },
                None => false,
            };
            if kept {
                state.running.push_back(id);
            } else {
                let capacity = self.kv.capacity();
                self.finish(
                    state,
                    id,
                    FinishReason::Evicted,
                    Some(Error::CapacityExceeded {
                        requested: token_count,
                        capacity,
                    }),
                );
            }
        }
    }

    fn has_ready_work(&self) -> bool {
        let state = self.state.lock();
        !state.running.is_empty() || self.prefill_due(&state)
    }
}

async fn run_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<SequenceId>) {
    let tick = shared.config.tick_interval();
    let mut progressed = false;
    loop {
        let shutdown = shared.shutdown.notified();
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }

        if !progressed || !shared.has_ready_work() {
            tokio::select! {
                biased;
                _ = shutdown => break,
                received = rx.recv() => match received {
                    Some(id) => shared.admit(id),
                    None => break,
                },
                _ = tokio::time::sleep(tick) => {}
            }
        }
        while let Ok(id) = rx.try_recv() {
            shared.admit(id);
        }

        progressed = false;
        if let Some(batch) = shared.form_prefill() {
            shared.execute(batch).await;
            progressed = true;
        }
        if let Some(batch) = shared.form_decode() {
            shared.execute(batch).await;
            progressed = true;
        }
    }
    debug!("Batcher loop exited");
}
