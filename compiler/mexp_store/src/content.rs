//! Addressable storage for expansion output.
//!
//! Blobs are byte strings tagged with the step that allocated them. Writes
//! from one step are batched into a [`Changeset`] and applied in one call, so
//! either the whole step's output lands or none of it does.

// Arc backs DocumentView - all sharing goes through the newtype
#![expect(
    clippy::disallowed_types,
    reason = "Arc is the implementation of DocumentView"
)]

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mexp_ir::{hash_bytes, BlobId, ContentHash, Step};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::StorageError;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Blob {
    bytes: Vec<u8>,
    step: Step,
    hash: ContentHash,
}

impl Blob {
    fn new(bytes: Vec<u8>, step: Step) -> Self {
        let hash = hash_bytes(&bytes);
        Blob { bytes, step, hash }
    }
}

/// Blob storage for expansion output, organized by step.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ContentStore {
    blobs: FxHashMap<BlobId, Blob>,
    /// Next id to allocate. Never decreases, so ids are never reused.
    next_id: u32,
    /// Open editable views. Not persisted.
    #[serde(skip)]
    views: FxHashMap<BlobId, DocumentView>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new blob tagged with `step`.
    pub fn create(&mut self, step: Step, bytes: Vec<u8>) -> BlobId {
        let id = BlobId::from_raw(self.next_id);
        self.next_id += 1;
        self.blobs.insert(id, Blob::new(bytes, step));
        id
    }

    pub fn contains(&self, blob: BlobId) -> bool {
        self.blobs.contains_key(&blob)
    }

    pub fn read(&self, blob: BlobId) -> Option<&[u8]> {
        self.blobs.get(&blob).map(|b| b.bytes.as_slice())
    }

    /// Read a blob as UTF-8 text. `None` if missing or not valid UTF-8.
    pub fn read_text(&self, blob: BlobId) -> Option<&str> {
        self.read(blob).and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    pub fn content_hash(&self, blob: BlobId) -> Option<ContentHash> {
        self.blobs.get(&blob).map(|b| b.hash)
    }

    pub fn step_of(&self, blob: BlobId) -> Option<Step> {
        self.blobs.get(&blob).map(|b| b.step)
    }

    /// Replace a blob's bytes in place, keeping its id and step.
    pub fn overwrite(&mut self, blob: BlobId, bytes: Vec<u8>) -> Result<(), StorageError> {
        let Some(slot) = self.blobs.get_mut(&blob) else {
            return Err(StorageError::corrupted(format!(
                "cannot overwrite {blob}: blob does not exist"
            )));
        };
        let step = slot.step;
        *slot = Blob::new(bytes, step);
        Ok(())
    }

    /// Delete a blob. Returns whether it existed.
    ///
    /// Any open view of the blob stops being live.
    pub fn delete(&mut self, blob: BlobId) -> bool {
        if let Some(view) = self.views.remove(&blob) {
            view.invalidate();
        }
        self.blobs.remove(&blob).is_some()
    }

    /// Re-tag a blob with a different step. Returns whether it existed.
    pub fn retag(&mut self, blob: BlobId, step: Step) -> bool {
        match self.blobs.get_mut(&blob) {
            Some(b) => {
                b.step = step;
                true
            }
            None => false,
        }
    }

    /// Blobs allocated in `step`, in id order.
    pub fn blobs_in_step(&self, step: Step) -> Vec<BlobId> {
        let mut ids: Vec<BlobId> = self
            .blobs
            .iter()
            .filter(|(_, b)| b.step == step)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of blobs per step, indexed by step.
    pub fn step_histogram(&self) -> Vec<usize> {
        let mut counts = Vec::new();
        for blob in self.blobs.values() {
            let idx = blob.step.index();
            if counts.len() <= idx {
                counts.resize(idx + 1, 0);
            }
            counts[idx] += 1;
        }
        counts
    }

    pub fn blob_ids(&self) -> impl Iterator<Item = BlobId> + '_ {
        self.blobs.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Drop every blob and view. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        for (_, view) in self.views.drain() {
            view.invalidate();
        }
        self.blobs.clear();
    }

    /// Open (or reuse) a live view of a blob's text.
    pub fn open_view(&mut self, blob: BlobId) -> Option<DocumentView> {
        let bytes = self.read(blob)?;
        if let Some(view) = self.views.get(&blob) {
            return Some(view.clone());
        }
        let view = DocumentView::new(bytes);
        self.views.insert(blob, view.clone());
        Some(view)
    }

    /// Close a view; later writes no longer reach it.
    pub fn close_view(&mut self, blob: BlobId) {
        self.views.remove(&blob);
    }

    /// Push the blob's current bytes into its open view, if any.
    ///
    /// Returns whether a view was updated.
    pub fn sync_view(&self, blob: BlobId) -> bool {
        match (self.views.get(&blob), self.read(blob)) {
            (Some(view), Some(bytes)) => {
                view.sync(bytes);
                true
            }
            _ => false,
        }
    }

    /// Apply a step's changeset atomically.
    ///
    /// Every overwrite, touch and delete target is checked before anything is
    /// written; a missing target means the index points at output that is gone,
    /// which is reported as corruption with the store left untouched.
    pub fn apply(&mut self, changeset: Changeset) -> Result<AppliedChangeset, StorageError> {
        for op in &changeset.ops {
            match op {
                ChangeOp::Overwrite { blob, .. }
                | ChangeOp::Touch { blob }
                | ChangeOp::Delete { blob } => {
                    if !self.contains(*blob) {
                        return Err(StorageError::corrupted(format!(
                            "changeset references missing {blob}"
                        )));
                    }
                }
                ChangeOp::Create { .. } => {}
            }
        }

        let mut applied = AppliedChangeset::default();
        for op in changeset.ops {
            match op {
                ChangeOp::Create { step, bytes } => {
                    applied.created.push(self.create(step, bytes));
                }
                ChangeOp::Overwrite { blob, bytes } => {
                    self.overwrite(blob, bytes)?;
                    applied.overwritten += 1;
                }
                ChangeOp::Touch { .. } => applied.touched += 1,
                ChangeOp::Delete { blob } => {
                    if self.delete(blob) {
                        applied.deleted += 1;
                    }
                }
            }
        }

        tracing::debug!(
            created = applied.created.len(),
            overwritten = applied.overwritten,
            touched = applied.touched,
            deleted = applied.deleted,
            "applied changeset"
        );
        Ok(applied)
    }
}

/// Refers to a blob a changeset will create once applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChangeTicket(u32);

/// One pending blob operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeOp {
    /// Allocate a new blob tagged with `step`.
    Create { step: Step, bytes: Vec<u8> },
    /// Replace the bytes of an existing blob, preserving its identity.
    Overwrite { blob: BlobId, bytes: Vec<u8> },
    /// Re-resolve an existing blob without writing.
    Touch { blob: BlobId },
    /// Remove a blob.
    Delete { blob: BlobId },
}

/// A batch of blob operations applied as one unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Changeset {
    ops: Vec<ChangeOp>,
    creates: u32,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, step: Step, bytes: Vec<u8>) -> ChangeTicket {
        let ticket = ChangeTicket(self.creates);
        self.creates += 1;
        self.ops.push(ChangeOp::Create { step, bytes });
        ticket
    }

    pub fn overwrite(&mut self, blob: BlobId, bytes: Vec<u8>) {
        self.ops.push(ChangeOp::Overwrite { blob, bytes });
    }

    pub fn touch(&mut self, blob: BlobId) {
        self.ops.push(ChangeOp::Touch { blob });
    }

    pub fn delete(&mut self, blob: BlobId) {
        self.ops.push(ChangeOp::Delete { blob });
    }

    pub fn ops(&self) -> &[ChangeOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What applying a changeset did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppliedChangeset {
    created: Vec<BlobId>,
    pub overwritten: usize,
    pub touched: usize,
    pub deleted: usize,
}

impl AppliedChangeset {
    /// The blob allocated for a ticket.
    pub fn blob(&self, ticket: ChangeTicket) -> Option<BlobId> {
        self.created.get(ticket.0 as usize).copied()
    }

    pub fn created(&self) -> &[BlobId] {
        &self.created
    }

    /// Blobs whose bytes were written (created or overwritten).
    pub fn bytes_written(&self) -> usize {
        self.created.len() + self.overwritten
    }
}

struct ViewState {
    text: RwLock<String>,
    live: AtomicBool,
    revision: AtomicU64,
}

/// A live, shared view of one blob's text.
///
/// Commits push new bytes into open views so readers attached to a blob see
/// the update without reopening it.
#[derive(Clone)]
pub struct DocumentView(Arc<ViewState>);

impl DocumentView {
    fn new(bytes: &[u8]) -> Self {
        DocumentView(Arc::new(ViewState {
            text: RwLock::new(String::from_utf8_lossy(bytes).into_owned()),
            live: AtomicBool::new(true),
            revision: AtomicU64::new(0),
        }))
    }

    pub fn text(&self) -> String {
        self.0.text.read().clone()
    }

    /// Whether the blob behind this view still exists.
    pub fn is_live(&self) -> bool {
        self.0.live.load(Ordering::Acquire)
    }

    /// Number of times the view has been synchronized.
    pub fn revision(&self) -> u64 {
        self.0.revision.load(Ordering::Acquire)
    }

    fn sync(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut current = self.0.text.write();
        if *current != text {
            *current = text.into_owned();
            self.0.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn invalidate(&self) {
        self.0.live.store(false, Ordering::Release);
    }
}

impl fmt::Debug for DocumentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentView")
            .field("live", &self.is_live())
            .field("revision", &self.revision())
            .finish_non_exhaustive()
    }
}
