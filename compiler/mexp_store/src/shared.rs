//! Thread-safe handles to the index and the content store.
//!
//! Workers extracting and expanding calls hold read guards concurrently; the
//! step's commit takes the write guard. `parking_lot` guards are not
//! poisoned, so a panicking worker does not wedge the coordinator.

// Arc is the implementation of the shared handles - all usage goes through the newtypes
#![expect(
    clippy::disallowed_types,
    reason = "Arc is the implementation of SharedIndex and SharedStore"
)]

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{ContentStore, ExpansionIndex};

/// Shared, single-writer handle to the [`ExpansionIndex`].
#[derive(Clone, Default)]
pub struct SharedIndex(Arc<RwLock<ExpansionIndex>>);

impl SharedIndex {
    pub fn new(index: ExpansionIndex) -> Self {
        SharedIndex(Arc::new(RwLock::new(index)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ExpansionIndex> {
        self.0.read()
    }

    /// Exclusive access for commits.
    pub fn write(&self) -> RwLockWriteGuard<'_, ExpansionIndex> {
        self.0.write()
    }
}

impl fmt::Debug for SharedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = self.0.read();
        write!(f, "SharedIndex(records: {}, files: {})", index.len(), index.file_count())
    }
}

/// Shared handle to the [`ContentStore`].
#[derive(Clone, Default)]
pub struct SharedStore(Arc<RwLock<ContentStore>>);

impl SharedStore {
    pub fn new(store: ContentStore) -> Self {
        SharedStore(Arc::new(RwLock::new(store)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ContentStore> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ContentStore> {
        self.0.write()
    }
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedStore(blobs: {})", self.0.read().len())
    }
}
