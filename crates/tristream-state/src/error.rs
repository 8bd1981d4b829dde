//! State persistence errors.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for state operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// State persistence error.
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file was written by an unsupported format version.
    #[error("Incompatible state format: found version {found}, supported {supported}")]
    IncompatibleFormat {
        /// Version in the file header
        found: u32,
        /// Version this build reads
        supported: u32,
    },

    /// The file does not start with the state magic.
    #[error("Not a state file: bad magic {0:?}")]
    InvalidMagic([u8; 4]),

    /// Header, length or checksum mismatch.
    #[error("Corrupt state file: {0}")]
    Corrupt(String),

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Snapshot index could not be read or written.
    #[error("Snapshot index error: {0}")]
    Index(#[from] serde_json::Error),

    /// No snapshot at the given path or id.
    #[error("Snapshot not found: {0}")]
    NotFound(PathBuf),

    /// `initialize` has not been called.
    #[error("State manager not initialized")]
    NotInitialized,
}

impl From<bincode::Error> for StateError {
    fn from(err: bincode::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

impl From<StateError> for tristream_core::Error {
    fn from(err: StateError) -> Self {
        use tristream_core::Error;
        match err {
            StateError::IncompatibleFormat { found, supported } => {
                Error::IncompatibleFormat { found, supported }
            }
            StateError::InvalidMagic(_) | StateError::Corrupt(_) => Error::Corrupt(err.to_string()),
            StateError::Serialization(msg) => Error::Serialization(msg),
            StateError::NotInitialized => Error::NotInitialized("state manager".into()),
            other => Error::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_conversion() {
        let err: tristream_core::Error = StateError::IncompatibleFormat {
            found: 9,
            supported: 1,
        }
        .into();
        assert_eq!(
            err,
            tristream_core::Error::IncompatibleFormat {
                found: 9,
                supported: 1
            }
        );

        let err: tristream_core::Error = StateError::Corrupt("short read".into()).into();
        assert_eq!(err.code(), "corrupt");
    }
}
