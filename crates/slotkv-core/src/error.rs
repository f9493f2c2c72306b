//! Error types for slotkv operations
//!
//! Every failure surfaced by the cache or the on-disk table is a `StoreError`.
//! Stale writes are not errors: they come back as a normal `false` outcome.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// slotkv error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Raw key is shorter than the key metadata (hash digest) prefix
    InvalidKey {
        /// Length of the rejected key
        len: usize,
        /// Minimum accepted length
        min: usize,
    },

    /// Raw value is shorter than the clocktime prefix
    InvalidValue {
        /// Length of the rejected value
        len: usize,
        /// Minimum accepted length
        min: usize,
    },

    /// Entry size exceeds maximum allowed
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Checksum verification failed while reading a record
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Checksum stored in the record header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
        /// Byte offset of the record
        offset: u64,
    },

    /// On-disk record is malformed
    Corrupted {
        /// Data file path
        path: PathBuf,
        /// Byte offset of the bad record
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// A shard buffer would have to grow past its ceiling
    BufferExhausted {
        /// Bytes the operation needed
        requested: usize,
        /// Largest reservation a shard may hold
        limit: usize,
    },

    /// Some dirty entries could not be written back; they are still dirty
    PartialFlush {
        /// Raw keys whose write-back failed
        failed: Vec<Vec<u8>>,
        /// Message of the first failure
        reason: String,
    },

    /// Configuration rejected by `Config::validate`
    InvalidConfig(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::InvalidKey { len, min } => {
                write!(f, "invalid key: {} bytes, need at least {}", len, min)
            }

            StoreError::InvalidValue { len, min } => {
                write!(f, "invalid value: {} bytes, need at least {}", len, min)
            }

            StoreError::OversizedEntry { entry_size, max_size, component } => {
                write!(f, "Entry {} too large: {} bytes exceeds limit of {} bytes",
                       component, entry_size, max_size)
            }

            StoreError::ChecksumMismatch { path, expected, actual, offset } => {
                write!(f, "Checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       path.display(), offset, expected, actual)
            }

            StoreError::Corrupted { path, offset, reason } => {
                write!(f, "Corrupted record in {} at offset {}: {}", path.display(), offset, reason)
            }

            StoreError::BufferExhausted { requested, limit } => {
                write!(f, "Shard buffer exhausted: {} bytes requested, limit {} bytes",
                       requested, limit)
            }

            StoreError::PartialFlush { failed, reason } => {
                write!(f, "Flush left {} entries dirty: {}", failed.len(), reason)
            }

            StoreError::InvalidConfig(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for slotkv operations
pub type StoreResult<T> = Result<T, StoreError>;
