//! Storage errors.

use std::fmt;
use std::path::PathBuf;

/// Error raised by the content store, the index, or snapshot persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// The index and the content store disagree.
    ///
    /// Not locally recoverable: the current run aborts and the next run
    /// rebuilds every record from scratch.
    Corrupted { detail: String },
    /// Reading or writing a snapshot failed.
    Io { path: PathBuf, message: String },
    /// A snapshot could not be decoded.
    Decode { message: String },
    /// A snapshot was written by an incompatible format version.
    VersionMismatch { found: u32, expected: u32 },
}

impl StorageError {
    pub fn corrupted(detail: impl Into<String>) -> Self {
        StorageError::Corrupted {
            detail: detail.into(),
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupted { .. })
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Corrupted { detail } => write!(f, "expansion storage corrupted: {detail}"),
            StorageError::Io { path, message } => {
                write!(f, "failed to access '{}': {message}", path.display())
            }
            StorageError::Decode { message } => write!(f, "failed to decode snapshot: {message}"),
            StorageError::VersionMismatch { found, expected } => write!(
                f,
                "snapshot format version {found} does not match expected version {expected}"
            ),
        }
    }
}

impl std::error::Error for StorageError {}
