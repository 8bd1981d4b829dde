//! Binary state file format.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "TRST"
//! 4       4     format version (u32 LE)
//! 8       4     flags (u32 LE)
//! 12      8     timestamp, unix nanos (i64 LE)
//! 20      4     checksum length (u32 LE, always 32)
//! 24      8     payload length (u64 LE)
//! 32      32    SHA-256 of the stored payload
//! 64      n     bincode payload, gzip-wrapped when FLAG_COMPRESSED is set
//! ```
//!
//! The version is checked before any payload byte is read, so a file from
//! a newer build fails with `IncompatibleFormat` instead of a parse error.
//! The checksum covers the bytes as stored, so corruption is detected
//! before decompression.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::{Result, StateError};
use crate::state::{CognitiveState, FORMAT_VERSION};

/// File magic.
pub const MAGIC: [u8; 4] = *b"TRST";

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 32;

/// SHA-256 digest length.
pub const CHECKSUM_LEN: u32 = 32;

/// Payloads larger than this are treated as corrupt.
pub const MAX_PAYLOAD_LEN: u64 = 1 << 30;

/// Header flag: the file is a checkpoint.
pub const FLAG_CHECKPOINT: u32 = 1;

/// Header flag: the payload is gzip-compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 1;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    /// Format version
    pub version: u32,
    /// Flag bits
    pub flags: u32,
    /// Capture time in unix nanoseconds
    pub timestamp_nanos: i64,
    /// Checksum length
    pub checksum_len: u32,
    /// Payload length
    pub payload_len: u64,
}

impl StateHeader {
    /// Whether the checkpoint flag is set.
    pub fn is_checkpoint(&self) -> bool {
        self.flags & FLAG_CHECKPOINT != 0
    }

    /// Whether the payload is gzip-compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf[20..24].copy_from_slice(&self.checksum_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }
}

fn le_u32(buf: &[u8]) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(b)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => StateError::Corrupt(format!("truncated {}", what)),
        _ => StateError::Io(e),
    })
}

/// Write `state` without flags.
pub fn write_binary_state<W: Write>(writer: &mut W, state: &CognitiveState) -> Result<StateHeader> {
    write_binary_state_with_flags(writer, state, 0)
}

/// Write `state` with the given header flags, uncompressed.
pub fn write_binary_state_with_flags<W: Write>(
    writer: &mut W,
    state: &CognitiveState,
    flags: u32,
) -> Result<StateHeader> {
    write_binary_state_with_options(writer, state, flags, None)
}

/// Write `state`, gzip-compressing the payload at `compression_level`
/// (1-9) when given. `FLAG_COMPRESSED` is derived from the level and
/// ignored in `flags`.
pub fn write_binary_state_with_options<W: Write>(
    writer: &mut W,
    state: &CognitiveState,
    flags: u32,
    compression_level: Option<u32>,
) -> Result<StateHeader> {
    let raw = bincode::serialize(state)?;
    let mut flags = flags & !FLAG_COMPRESSED;
    let payload = match compression_level {
        Some(level) => {
            flags |= FLAG_COMPRESSED;
            compress(&raw, level)?
        }
        None => raw,
    };
    let digest = Sha256::digest(&payload);

    let header = StateHeader {
        version: FORMAT_VERSION,
        flags,
        timestamp_nanos: state.timestamp.timestamp_nanos_opt().unwrap_or(0),
        checksum_len: CHECKSUM_LEN,
        payload_len: payload.len() as u64,
    };

    writer.write_all(&header.encode())?;
    writer.write_all(&digest)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(header)
}

/// Read and validate the header only.
pub fn read_header<R: Read>(reader: &mut R) -> Result<StateHeader> {
    let mut buf = [0u8; HEADER_LEN];
    read_exact(reader, &mut buf, "header")?;

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&buf[0..4]);
    if magic != MAGIC {
        return Err(StateError::InvalidMagic(magic));
    }

    let version = le_u32(&buf[4..8]);
    if version != FORMAT_VERSION {
        return Err(StateError::IncompatibleFormat {
            found: version,
            supported: FORMAT_VERSION,
        });
    }

    let header = StateHeader {
        version,
        flags: le_u32(&buf[8..12]),
        timestamp_nanos: le_u64(&buf[12..20]) as i64,
        checksum_len: le_u32(&buf[20..24]),
        payload_len: le_u64(&buf[24..32]),
    };

    if header.checksum_len != CHECKSUM_LEN {
        return Err(StateError::Corrupt(format!(
            "checksum length {} (expected {})",
            header.checksum_len, CHECKSUM_LEN
        )));
    }
    if header.payload_len > MAX_PAYLOAD_LEN {
        return Err(StateError::Corrupt(format!(
            "payload length {} exceeds limit",
            header.payload_len
        )));
    }
    Ok(header)
}

/// Read a state file, returning its header and state.
pub fn read_binary_state_with_header<R: Read>(
    reader: &mut R,
) -> Result<(StateHeader, CognitiveState)> {
    let header = read_header(reader)?;

    let mut checksum = [0u8; CHECKSUM_LEN as usize];
    read_exact(reader, &mut checksum, "checksum")?;

    let mut payload = vec![0u8; header.payload_len as usize];
    read_exact(reader, &mut payload, "payload")?;

    if Sha256::digest(&payload).as_slice() != checksum {
        return Err(StateError::Corrupt("payload checksum mismatch".into()));
    }
    if header.is_compressed() {
        payload = decompress(&payload)?;
    }

    let state: CognitiveState = bincode::deserialize(&payload)
        .map_err(|e| StateError::Corrupt(format!("payload decode: {}", e)))?;
    Ok((header, state))
}

fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level.min(9)),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data)
        .take(MAX_PAYLOAD_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|e| StateError::Corrupt(format!("payload decompress: {}", e)))?;
    if out.len() as u64 > MAX_PAYLOAD_LEN {
        return Err(StateError::Corrupt("decompressed payload exceeds limit".into()));
    }
    Ok(out)
}

/// Read a state file.
pub fn read_binary_state<R: Read>(reader: &mut R) -> Result<CognitiveState> {
    read_binary_state_with_header(reader).map(|(_, state)| state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tristream_core::StreamId;

    fn sample() -> CognitiveState {
        let mut state = CognitiveState::new("after warmup: ünïcode ✓\nsecond line");
        state.streams[StreamId::Gamma.index()].step = 17;
        state.streams[StreamId::Beta.index()].tokens_generated = 4096;
        state.kv_cache.used = 300;
        state.kv_cache.capacity = 1024;
        state.memory[0].peak_usage = 1 << 20;
        state.speculative.acceptance_rate = 0.625;
        state.metrics.avg_latency_ms = 12.5;
        state.metadata.insert("model".into(), "synthetic".into());
        state.seal().unwrap();
        state
    }

    fn encode(state: &CognitiveState) -> Vec<u8> {
        let mut buf = Vec::new();
        write_binary_state(&mut buf, state).unwrap();
        buf
    }

    #[test]
    fn test_roundtrip_preserves_description() {
        let state = sample();
        let bytes = encode(&state);
        assert_eq!(&bytes[0..4], b"TRST");

        let restored = read_binary_state(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.description, "after warmup: ünïcode ✓\nsecond line");
        assert!(restored.verify_checksum().unwrap());
    }

    #[test]
    fn test_header_layout() {
        let state = sample();
        let mut buf = Vec::new();
        let header = write_binary_state_with_flags(&mut buf, &state, FLAG_CHECKPOINT).unwrap();
        assert!(header.is_checkpoint());
        assert_eq!(buf.len(), HEADER_LEN + 32 + header.payload_len as usize);

        let read = read_header(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(read, header);
        assert_eq!(
            read.timestamp_nanos,
            state.timestamp.timestamp_nanos_opt().unwrap()
        );
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut bytes = encode(&sample());
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        // Truncate the payload: the version check must fire first.
        bytes.truncate(HEADER_LEN);
        let err = read_binary_state(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(
            err,
            StateError::IncompatibleFormat {
                found: 2,
                supported: 1
            }
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(&sample());
        bytes[0] = b'X';
        assert!(matches!(
            read_binary_state(&mut Cursor::new(bytes)),
            Err(StateError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = encode(&sample());
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            read_binary_state(&mut Cursor::new(bytes)),
            Err(StateError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = encode(&sample());
        bytes.truncate(bytes.len() - 5);
        let err = read_binary_state(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, StateError::Corrupt(msg) if msg.contains("payload")));
    }

    #[test]
    fn test_compressed_roundtrip() {
        let mut state = sample();
        state.description = "repetitive ".repeat(512);
        state.seal().unwrap();

        let mut plain = Vec::new();
        write_binary_state(&mut plain, &state).unwrap();
        let mut packed = Vec::new();
        let header =
            write_binary_state_with_options(&mut packed, &state, FLAG_CHECKPOINT, Some(6)).unwrap();
        assert!(header.is_compressed());
        assert!(header.is_checkpoint());
        assert!(packed.len() < plain.len());

        let (read, restored) = read_binary_state_with_header(&mut Cursor::new(packed)).unwrap();
        assert_eq!(read, header);
        assert_eq!(restored, state);
        assert!(restored.verify_checksum().unwrap());
    }

    #[test]
    fn test_compressed_flag_follows_level() {
        let state = sample();
        let mut buf = Vec::new();
        let header =
            write_binary_state_with_options(&mut buf, &state, FLAG_COMPRESSED, None).unwrap();
        assert!(!header.is_compressed());
        assert_eq!(read_binary_state(&mut Cursor::new(buf)).unwrap(), state);
    }

    #[test]
    fn test_compressed_corruption_detected() {
        let mut bytes = Vec::new();
        write_binary_state_with_options(&mut bytes, &sample(), 0, Some(1)).unwrap();
        let mid = HEADER_LEN + 32 + 4;
        bytes[mid] ^= 0x5a;
        assert!(matches!(
            read_binary_state(&mut Cursor::new(bytes)),
            Err(StateError::Corrupt(_))
        ));
    }

    #[test]
    fn test_oversized_length() {
        let mut bytes = encode(&sample());
        bytes[24..32].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert!(matches!(
            read_binary_state(&mut Cursor::new(bytes)),
            Err(StateError::Corrupt(_))
        ));
    }
}
