//! Core types used throughout Tristream.
//!
//! Identifiers, tokens and tensor element types shared by the engine,
//! state and CLI crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of concurrent inference streams.
pub const NUM_STREAMS: usize = 3;

/// Token ID type (vocabulary index).
pub type TokenId = u32;

/// One of the three concurrently running inference streams.
///
/// The discriminants are fixed and persisted in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    /// First stream
    Alpha = 0,
    /// Second stream
    Beta = 1,
    /// Third stream
    Gamma = 2,
}

impl StreamId {
    /// All streams in index order.
    pub const ALL: [StreamId; NUM_STREAMS] = [StreamId::Alpha, StreamId::Beta, StreamId::Gamma];

    /// Array index of this stream.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Look up a stream by index.
    pub fn from_index(index: usize) -> Result<Self> {
        Self::ALL
            .get(index)
            .copied()
            .ok_or(Error::InvalidStream(index))
    }

    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            StreamId::Alpha => "alpha",
            StreamId::Beta => "beta",
            StreamId::Gamma => "gamma",
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<usize> for StreamId {
    type Error = Error;

    fn try_from(index: usize) -> Result<Self> {
        Self::from_index(index)
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "alpha" | "0" => Ok(StreamId::Alpha),
            "beta" | "1" => Ok(StreamId::Beta),
            "gamma" | "2" => Ok(StreamId::Gamma),
            other => Err(Error::config(format!("unknown stream: {}", other))),
        }
    }
}

/// A unique identifier for a sequence (generation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl SequenceId {
    /// Create a new sequence ID.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the numeric value.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

impl From<u64> for SequenceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A single generated token as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Vocabulary id
    pub id: TokenId,
    /// Decoded text piece
    pub text: String,
    /// Log probability under the target model
    pub logprob: f32,
    /// Position in the generated output (0-based)
    pub position: usize,
    /// Originating stream
    pub stream: StreamId,
    /// Originating sequence
    pub sequence: SequenceId,
    /// Last token of the sequence
    pub is_final: bool,
    /// When the token was produced
    pub timestamp: DateTime<Utc>,
}

impl Token {
    /// Create a token stamped with the current time.
    pub fn new(
        id: TokenId,
        text: impl Into<String>,
        stream: StreamId,
        sequence: SequenceId,
        position: usize,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            logprob: 0.0,
            position,
            stream,
            sequence,
            is_final: false,
            timestamp: Utc::now(),
        }
    }

    /// Set the log probability.
    pub fn with_logprob(mut self, logprob: f32) -> Self {
        self.logprob = logprob;
        self
    }

    /// Mark as the final token.
    pub fn finalize(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit float
    F32,
    /// IEEE half precision
    F16,
    /// Brain float
    BF16,
    /// 32-bit signed integer
    I32,
    /// 8-bit signed integer
    I8,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => std::mem::size_of::<f32>(),
            DType::F16 => std::mem::size_of::<half::f16>(),
            DType::BF16 => std::mem::size_of::<half::bf16>(),
            DType::I32 => std::mem::size_of::<i32>(),
            DType::I8 => std::mem::size_of::<i8>(),
        }
    }

    /// Canonical name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::I32 => "int32",
            DType::I8 => "int8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::F32),
            "float16" | "f16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            "int32" | "i32" => Ok(DType::I32),
            "int8" | "i8" => Ok(DType::I8),
            _ => Err(Error::UnsupportedDtype(s.to_string())),
        }
    }
}

/// Reason a sequence stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The backend signalled end of sequence
    Stop,
    /// Reached the maximum number of new tokens
    Length,
    /// Nothing to generate (empty prompt or zero token budget)
    Empty,
    /// Cancelled by the caller or by shutdown
    Cancelled,
    /// KV cache slot was evicted under memory pressure
    Evicted,
    /// The batch step failed
    Error,
}

impl FinishReason {
    /// Whether the sequence ran to a natural end.
    pub const fn is_success(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::Length | FinishReason::Empty)
    }
}

impl FinishReason {
    /// Lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Empty => "empty",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Evicted => "evicted",
            FinishReason::Error => "error",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_fixed() {
        assert_eq!(StreamId::Alpha as usize, 0);
        assert_eq!(StreamId::Beta as usize, 1);
        assert_eq!(StreamId::Gamma as usize, 2);
        assert_eq!(StreamId::ALL.len(), NUM_STREAMS);
        assert!(StreamId::from_index(3).is_err());
        assert_eq!("beta".parse::<StreamId>().unwrap(), StreamId::Beta);
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_parse() {
        assert_eq!("float32".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("bf16".parse::<DType>().unwrap(), DType::BF16);
        assert!(matches!(
            "complex64".parse::<DType>(),
            Err(Error::UnsupportedDtype(_))
        ));
    }

    #[test]
    fn test_sequence_id_display() {
        assert_eq!(SequenceId::new(7).to_string(), "seq-7");
    }

    #[test]
    fn test_finish_reason() {
        assert!(FinishReason::Length.is_success());
        assert!(!FinishReason::Evicted.is_success());
        assert_eq!(FinishReason::Cancelled.to_string(), "cancelled");
    }
}
