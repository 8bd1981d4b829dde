//! Token streaming.
//!
//! - [`TokenStream`]: bounded per-sequence FIFO between the batch executor
//!   (producer) and the caller (consumer).
//! - [`StreamingResponse`]: accumulates tokens into text and converts the
//!   result into an [`InferenceResponse`].
//! - [`StreamMultiplexer`]: fan-in reader over several streams.
//! - [`StreamConsumer`]: reads a response until a stop sequence appears.
//!
//! Receiving is cancel-safe: a token is removed from the buffer only in the
//! same poll that returns it, so dropping a pending `recv` never loses data.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::select_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use tristream_core::{
    Error, FinishReason, InferenceResponse, Result, SequenceId, StreamId, Token, TokenId,
};

/// Default token stream capacity.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

struct Buffer {
    tokens: VecDeque<Token>,
    closed: bool,
    error: Option<Error>,
    finished_at: Option<Instant>,
}

struct StreamInner {
    stream: StreamId,
    sequence: SequenceId,
    capacity: usize,
    buffer: Mutex<Buffer>,
    readable: Notify,
    writable: Notify,
    sent: AtomicU64,
    started_at: Instant,
}

/// Bounded FIFO of tokens for one sequence.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct TokenStream {
    inner: Arc<StreamInner>,
}

impl TokenStream {
    /// Create a stream holding at most `capacity` undelivered tokens.
    pub fn new(stream: StreamId, sequence: SequenceId, capacity: usize) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                stream,
                sequence,
                capacity: capacity.max(1),
                buffer: Mutex::new(Buffer {
                    tokens: VecDeque::with_capacity(capacity.clamp(1, DEFAULT_STREAM_CAPACITY)),
                    closed: false,
                    error: None,
                    finished_at: None,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                sent: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    /// Stream the sequence runs on.
    pub fn stream_id(&self) -> StreamId {
        self.inner.stream
    }

    /// Sequence that owns this stream.
    pub fn sequence_id(&self) -> SequenceId {
        self.inner.sequence
    }

    /// Maximum buffered tokens.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tokens currently buffered.
    pub fn len(&self) -> usize {
        self.inner.buffer.lock().tokens.len()
    }

    /// Whether no tokens are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a token, waiting for buffer space.
    pub async fn send(&self, token: Token) -> Result<()> {
        let mut token = Some(token);
        loop {
            let notified = self.inner.writable.notified();
            if let Some(t) = token.take() {
                match self.push(t) {
                    Ok(()) => return Ok(()),
                    Err((t, Error::StreamFull { .. })) => token = Some(t),
                    Err((_, e)) => return Err(e),
                }
            }
            notified.await;
        }
    }

    /// Send a token without waiting.
    pub fn try_send(&self, token: Token) -> Result<()> {
        self.push(token).map_err(|(_, e)| e)
    }

    fn push(&self, token: Token) -> std::result::Result<(), (Token, Error)> {
        {
            let mut buf = self.inner.buffer.lock();
            if buf.closed {
                return Err((
                    token,
                    Error::ClosedStream {
                        sequence: self.inner.sequence,
                    },
                ));
            }
            if buf.tokens.len() >= self.inner.capacity {
                return Err((
                    token,
                    Error::StreamFull {
                        sequence: self.inner.sequence,
                    },
                ));
            }
            buf.tokens.push_back(token);
        }
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.readable.notify_waiters();
        Ok(())
    }

    /// Receive the next token.
    ///
    /// Returns `Ok(None)` once the stream is closed and drained, or the
    /// close error if it was closed with [`close_with_error`](Self::close_with_error).
    pub async fn recv(&self) -> Result<Option<Token>> {
        loop {
            let notified = self.inner.readable.notified();
            if let Some(outcome) = self.poll_buffer() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Receive the next token, failing with [`Error::Timeout`] after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<Token>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::timeout(
                format!("recv on {}", self.inner.sequence),
                timeout,
            )),
        }
    }

    /// Receive without waiting; `Ok(None)` if nothing is buffered yet.
    pub fn try_recv(&self) -> Result<Option<Token>> {
        self.poll_buffer().unwrap_or(Ok(None))
    }

    /// `None` means "nothing yet, keep waiting".
    fn poll_buffer(&self) -> Option<Result<Option<Token>>> {
        let outcome = {
            let mut buf = self.inner.buffer.lock();
            if let Some(token) = buf.tokens.pop_front() {
                Some(Ok(Some(token)))
            } else if buf.closed {
                Some(match buf.error.clone() {
                    Some(e) => Err(e),
                    None => Ok(None),
                })
            } else {
                None
            }
        };
        if matches!(outcome, Some(Ok(Some(_)))) {
            self.inner.writable.notify_waiters();
        }
        outcome
    }

    /// Close the stream. Buffered tokens remain readable. Idempotent.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Close the stream and report `error` to readers once drained.
    pub fn close_with_error(&self, error: Error) {
        self.close_inner(Some(error));
    }

    fn close_inner(&self, error: Option<Error>) {
        {
            let mut buf = self.inner.buffer.lock();
            if buf.closed {
                return;
            }
            buf.closed = true;
            buf.error = error;
            buf.finished_at = Some(Instant::now());
        }
        trace!("Closed token stream for {}", self.inner.sequence);
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.buffer.lock().closed
    }

    /// Error the stream was closed with, if any.
    pub fn close_error(&self) -> Option<Error> {
        self.inner.buffer.lock().error.clone()
    }

    /// Tokens accepted by the stream so far.
    pub fn token_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    /// Production rate from open until close (or now).
    pub fn tokens_per_second(&self) -> f64 {
        let end = self
            .inner
            .buffer
            .lock()
            .finished_at
            .unwrap_or_else(Instant::now);
        let secs = end.duration_since(self.inner.started_at).as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.token_count() as f64 / secs
        }
    }
}

impl fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStream")
            .field("stream", &self.inner.stream)
            .field("sequence", &self.inner.sequence)
            .field("capacity", &self.inner.capacity)
            .field("sent", &self.token_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct Accumulated {
    tokens: Vec<Token>,
    text: String,
}

/// Caller-side accumulator over a [`TokenStream`].
pub struct StreamingResponse {
    request_id: String,
    step: u64,
    prompt_tokens: usize,
    max_new_tokens: usize,
    metadata: HashMap<String, String>,
    stream: TokenStream,
    started_at: Instant,
    acc: Mutex<Accumulated>,
}

impl StreamingResponse {
    /// Wrap a stream.
    pub fn new(
        request_id: impl Into<String>,
        stream: TokenStream,
        prompt_tokens: usize,
        max_new_tokens: usize,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            step: 0,
            prompt_tokens,
            max_new_tokens,
            metadata: HashMap::new(),
            stream,
            started_at: Instant::now(),
            acc: Mutex::new(Accumulated::default()),
        }
    }

    /// Carry a caller step and metadata into the final response.
    pub fn with_context(mut self, step: u64, metadata: HashMap<String, String>) -> Self {
        self.step = step;
        self.metadata = metadata;
        self
    }

    /// Underlying token stream.
    pub fn stream(&self) -> &TokenStream {
        &self.stream
    }

    /// Sequence that owns the stream.
    pub fn sequence_id(&self) -> SequenceId {
        self.stream.sequence_id()
    }

    /// Append a token to the token list and the text buffer.
    pub fn accumulate_token(&self, token: Token) {
        let mut acc = self.acc.lock();
        acc.text.push_str(&token.text);
        acc.tokens.push(token);
    }

    /// Text accumulated so far.
    pub fn text(&self) -> String {
        self.acc.lock().text.clone()
    }

    /// Tokens accumulated so far.
    pub fn tokens(&self) -> Vec<Token> {
        self.acc.lock().tokens.clone()
    }

    /// Receive and accumulate the next token.
    pub async fn next_token(&self) -> Result<Option<Token>> {
        let token = self.stream.recv().await?;
        if let Some(ref t) = token {
            self.accumulate_token(t.clone());
        }
        Ok(token)
    }

    /// Drain the stream and return the final response.
    pub async fn collect(&self) -> Result<InferenceResponse> {
        loop {
            match self.next_token().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(Error::Cancelled { .. }) | Err(Error::CapacityExceeded { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.to_inference_response())
    }

    /// Why generation stopped, as far as the stream can tell.
    pub fn finish_reason(&self) -> FinishReason {
        match self.stream.close_error() {
            Some(Error::Cancelled { .. }) => FinishReason::Cancelled,
            Some(Error::CapacityExceeded { .. }) => FinishReason::Evicted,
            Some(_) => FinishReason::Error,
            None => {
                if self.acc.lock().tokens.len() >= self.max_new_tokens {
                    FinishReason::Length
                } else {
                    FinishReason::Stop
                }
            }
        }
    }

    /// Convert the accumulated state into a response.
    pub fn to_inference_response(&self) -> InferenceResponse {
        let elapsed = self.started_at.elapsed();
        let finish_reason = self.finish_reason();
        let acc = self.acc.lock();
        let tokens: Vec<TokenId> = acc.tokens.iter().map(|t| t.id).collect();
        let secs = elapsed.as_secs_f64();
        InferenceResponse {
            request_id: self.request_id.clone(),
            sequence_id: self.stream.sequence_id(),
            stream: self.stream.stream_id(),
            step: self.step,
            output: acc.text.clone(),
            tokens_per_sec: if secs > 0.0 {
                acc.tokens.len() as f64 / secs
            } else {
                0.0
            },
            tokens,
            prompt_tokens: self.prompt_tokens,
            finish_reason,
            latency_ms: elapsed.as_millis() as u64,
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("request_id", &self.request_id)
            .field("stream", &self.stream)
            .finish()
    }
}

type RecvFuture<'a> = Pin<Box<dyn Future<Output = (usize, Result<Option<Token>>)> + Send + 'a>>;

/// Fan-in reader across several token streams.
///
/// Streams are polled starting after the one that produced the previous
/// token, so a busy stream cannot starve the others. Closing the
/// multiplexer leaves the underlying streams open.
pub struct StreamMultiplexer {
    streams: Vec<TokenStream>,
    finished: Mutex<Vec<bool>>,
    cursor: AtomicUsize,
    closed: AtomicBool,
    close_notify: Notify,
}

impl StreamMultiplexer {
    /// Multiplex `streams`.
    pub fn new(streams: Vec<TokenStream>) -> Self {
        let n = streams.len();
        Self {
            streams,
            finished: Mutex::new(vec![false; n]),
            cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Number of multiplexed streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether there are no streams.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Next token from any stream, with the index of the stream it came from.
    ///
    /// Returns `None` once the multiplexer is closed or every stream has
    /// closed and drained.
    pub async fn recv(&self) -> Option<(usize, Token)> {
        loop {
            let closing = self.close_notify.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let order = self.poll_order();
            if order.is_empty() {
                return None;
            }

            let futures: Vec<RecvFuture<'_>> = order
                .into_iter()
                .map(|idx| {
                    let stream = &self.streams[idx];
                    Box::pin(async move { (idx, stream.recv().await) }) as RecvFuture<'_>
                })
                .collect();

            let ((idx, outcome), _, _) = tokio::select! {
                biased;
                _ = closing => return None,
                ready = select_all(futures) => ready,
            };

            match outcome {
                Ok(Some(token)) => {
                    self.cursor.store(idx + 1, Ordering::Relaxed);
                    return Some((idx, token));
                }
                Ok(None) | Err(_) => {
                    debug!("Multiplexed stream {} finished", idx);
                    self.finished.lock()[idx] = true;
                }
            }
        }
    }

    /// Like [`recv`](Self::recv), bounded by `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(usize, Token)>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::timeout("multiplexer recv", timeout))
    }

    fn poll_order(&self) -> Vec<usize> {
        let n = self.streams.len();
        let start = self.cursor.load(Ordering::Relaxed);
        let finished = self.finished.lock();
        (0..n)
            .map(|i| (start + i) % n)
            .filter(|&i| !finished[i])
            .collect()
    }

    /// Stop multiplexing. Underlying streams stay open.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Result of consuming a response with stop sequences.
#[derive(Debug, Clone)]
pub struct ConsumeOutcome {
    /// Text up to (not including) the stop sequence
    pub text: String,
    /// Tokens read
    pub tokens: Vec<Token>,
    /// Stop sequence that ended consumption
    pub stopped_by: Option<String>,
}

/// Reads a [`StreamingResponse`] until the stream ends or a stop sequence
/// appears in the accumulated text.
pub struct StreamConsumer {
    response: StreamingResponse,
    stop_sequences: Vec<String>,
}

impl StreamConsumer {
    /// Consume `response`, stopping at any of `stop_sequences`.
    pub fn new(response: StreamingResponse, stop_sequences: Vec<String>) -> Self {
        Self {
            response,
            stop_sequences: stop_sequences.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    /// Read to completion.
    pub async fn consume(&self) -> Result<ConsumeOutcome> {
        loop {
            match self.response.next_token().await? {
                Some(_) => {
                    let text = self.response.text();
                    if let Some((stop, pos)) = self.find_stop(&text) {
                        return Ok(ConsumeOutcome {
                            text: text[..pos].to_string(),
                            tokens: self.response.tokens(),
                            stopped_by: Some(stop),
                        });
                    }
                }
                None => {
                    return Ok(ConsumeOutcome {
                        text: self.response.text(),
                        tokens: self.response.tokens(),
                        stopped_by: None,
                    })
                }
            }
        }
    }

    fn find_stop(&self, text: &str) -> Option<(String, usize)> {
        self.stop_sequences
            .iter()
            .filter_map(|s| text.find(s.as_str()).map(|pos| (s.clone(), pos)))
            .min_by_key(|(_, pos)| *pos)
    }

    /// The wrapped response.
    pub fn response(&self) -> &StreamingResponse {
        &self.response
    }
}
