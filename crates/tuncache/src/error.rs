//! Error types for tuncache

use std::fmt;
use std::io;

/// Result type alias for tuncache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by snapshot persistence.
///
/// Cache operations themselves never fail: capacity violations are
/// corrected by eviction and misses are reported as `None`/`false`.
#[derive(Debug)]
pub enum Error {
    /// I/O error while reading or writing a snapshot
    Io(io::Error),

    /// Snapshot payload could not be encoded
    Encode(String),

    /// Snapshot stream is malformed or truncated
    Decode(String),

    /// Snapshot was written by an unsupported format version
    UnsupportedVersion(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Encode(msg) => write!(f, "Snapshot encode error: {}", msg),
            Error::Decode(msg) => write!(f, "Snapshot decode error: {}", msg),
            Error::UnsupportedVersion(v) => {
                write!(f, "Unsupported snapshot version: {}", v)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        match err {
            bincode::error::EncodeError::Io { inner, .. } => Error::Io(inner),
            other => Error::Encode(other.to_string()),
        }
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}
