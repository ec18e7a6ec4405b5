//! On-disk snapshot of the index and its blobs.
//!
//! # Format
//!
//! A single bincode-encoded file:
//!
//! ```text
//! version: u32 | clean_start: bool | index: ExpansionIndex | store: ContentStore
//! ```
//!
//! Snapshots are written to a temporary file in the target directory and
//! renamed into place, so a crash mid-write leaves the previous snapshot.
//! A snapshot from another format version is rejected; callers treat that the
//! same as a clean start.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ContentStore, ExpansionIndex, StorageError};

/// Current snapshot format version. Bump on any change to persisted types.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Borrowed form used for writing; field order must match [`IndexSnapshot`].
#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    clean_start: bool,
    index: &'a ExpansionIndex,
    store: &'a ContentStore,
}

/// A loaded snapshot.
#[derive(Debug, Deserialize)]
pub struct IndexSnapshot {
    version: u32,
    /// The previous run hit storage corruption; the next run starts from scratch.
    pub clean_start: bool,
    pub index: ExpansionIndex,
    pub store: ContentStore,
}

impl IndexSnapshot {
    /// Write a snapshot atomically.
    pub fn save(
        path: &Path,
        index: &ExpansionIndex,
        store: &ContentStore,
        clean_start: bool,
    ) -> Result<(), StorageError> {
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            clean_start,
            index,
            store,
        };
        let bytes = bincode::serialize(&snapshot).map_err(|e| StorageError::Decode {
            message: format!("failed to encode snapshot: {e}"),
        })?;

        let io_err = |e: std::io::Error| StorageError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        tracing::debug!(
            path = %path.display(),
            records = index.len(),
            blobs = store.len(),
            bytes = bytes.len(),
            "saved expansion snapshot"
        );
        Ok(())
    }

    /// Load a snapshot. `Ok(None)` if no snapshot exists yet.
    pub fn load(path: &Path) -> Result<Option<Self>, StorageError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };

        // Check the version before decoding the rest: a layout change would
        // otherwise surface as a confusing decode error.
        let version: u32 = bincode::deserialize(&bytes).map_err(|e| StorageError::Decode {
            message: e.to_string(),
        })?;
        if version != SNAPSHOT_VERSION {
            return Err(StorageError::VersionMismatch {
                found: version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let snapshot: IndexSnapshot =
            bincode::deserialize(&bytes).map_err(|e| StorageError::Decode {
                message: e.to_string(),
            })?;
        Ok(Some(snapshot))
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}
