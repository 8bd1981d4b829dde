//! Error types for the Tristream serving engine.
//!
//! The taxonomy mirrors the failure classes the engine distinguishes at
//! runtime: allocation and capacity errors are returned to the immediate
//! caller for local recovery, format errors abort a load entirely, and
//! batch failures are attributed to the member sequences of that batch.

use std::time::Duration;

use thiserror::Error;

use crate::types::SequenceId;

/// Specialized Result type for Tristream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Tristream operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A memory pool could not satisfy an allocation.
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested (after alignment)
        requested: usize,
        /// Bytes still available in the pool
        available: usize,
    },

    /// The KV cache is full and no slot could be evicted.
    #[error("KV cache capacity exceeded: requested {requested} tokens, capacity {capacity}")]
    CapacityExceeded {
        /// Tokens requested
        requested: usize,
        /// Total cache capacity in tokens
        capacity: usize,
    },

    /// A bounded operation did not finish before its deadline.
    #[error("Operation '{operation}' timed out after {duration_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// A state file uses a format version this build cannot read.
    #[error("Incompatible state format: found version {found}, supported {supported}")]
    IncompatibleFormat {
        /// Version found in the file header
        found: u32,
        /// Version this reader supports
        supported: u32,
    },

    /// Operation on a token stream that has already been closed.
    #[error("Token stream for {sequence} is closed")]
    ClosedStream {
        /// Sequence that owns the stream
        sequence: SequenceId,
    },

    /// A bounded token stream had no room for a non-blocking send.
    #[error("Token stream for {sequence} is full")]
    StreamFull {
        /// Sequence that owns the stream
        sequence: SequenceId,
    },

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pool handle outlived the pool generation it was issued for.
    #[error("Stale handle: issued for generation {handle}, pool is at generation {current}")]
    StaleHandle {
        /// Generation recorded in the handle
        handle: u64,
        /// Current pool generation
        current: u64,
    },

    /// The tensor dtype is not supported.
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// A sequence state transition is not permitted.
    #[error("Invalid transition for {sequence}: {from} -> {to}")]
    InvalidTransition {
        /// Sequence being transitioned
        sequence: SequenceId,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A component was used before it was initialized.
    #[error("{0} is not initialized")]
    NotInitialized(String),

    /// A component was closed twice.
    #[error("{0} is already closed")]
    AlreadyClosed(String),

    /// The external compute backend failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Speculative decoding failed.
    #[error("Speculative decoding error: {0}")]
    Speculative(String),

    /// The operation was cancelled.
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Why the operation was cancelled
        reason: String,
    },

    /// Persisted data failed an integrity check.
    #[error("Corrupt state: {0}")]
    Corrupt(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(String),

    /// The engine or batcher is shutting down.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unknown stream index.
    #[error("Invalid stream id: {0}")]
    InvalidStream(usize),

    /// Unknown sequence.
    #[error("Sequence not found: {0}")]
    SequenceNotFound(SequenceId),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether the caller may retry after backoff or eviction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::OutOfMemory { .. }
                | Error::CapacityExceeded { .. }
                | Error::Timeout { .. }
                | Error::StreamFull { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::OutOfMemory { .. } => "out_of_memory",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::Timeout { .. } => "timeout",
            Error::IncompatibleFormat { .. } => "incompatible_format",
            Error::ClosedStream { .. } => "closed_stream",
            Error::StreamFull { .. } => "stream_full",
            Error::Config(_) => "config",
            Error::StaleHandle { .. } => "stale_handle",
            Error::UnsupportedDtype(_) => "unsupported_dtype",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::InvalidState(_) => "invalid_state",
            Error::NotInitialized(_) => "not_initialized",
            Error::AlreadyClosed(_) => "already_closed",
            Error::Backend(_) => "backend",
            Error::Speculative(_) => "speculative",
            Error::Cancelled { .. } => "cancelled",
            Error::Corrupt(_) => "corrupt",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Shutdown => "shutdown",
            Error::InvalidStream(_) => "invalid_stream",
            Error::SequenceNotFound(_) => "sequence_not_found",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfMemory {
            requested: 1024,
            available: 64,
        };
        assert_eq!(
            err.to_string(),
            "Out of memory: requested 1024 bytes, 64 available"
        );

        let err = Error::timeout("recv", Duration::from_millis(50));
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_retryable() {
        assert!(Error::CapacityExceeded {
            requested: 10,
            capacity: 5
        }
        .is_retryable());
        assert!(!Error::IncompatibleFormat {
            found: 2,
            supported: 1
        }
        .is_retryable());
        assert!(!Error::Shutdown.is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(Error::config("bad").code(), "config");
        assert_eq!(
            Error::ClosedStream {
                sequence: SequenceId::new(3)
            }
            .code(),
            "closed_stream"
        );
    }
}
