//! The mapping from call identity to its last known expansion.
//!
//! # Ownership
//!
//! Each record belongs to the file that contains its call. When a record's
//! blob goes away, the expansion file that blob backed goes with it, along
//! with every record in that file and, recursively, their blobs:
//!
//! ```text
//! file#1:0 ──► blob#4 == expansion(blob#4) ──► expansion(blob#4):0 ──► blob#9 ...
//! ```
//!
//! Removal operations return the blobs made unreachable this way so the
//! caller can delete them; the index never touches the content store except
//! in [`ExpansionIndex::collect_garbage`].

use std::collections::BTreeSet;

use mexp_ir::{BlobId, CallId, ContentHash, FileId, Step};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::{ContentStore, ExpansionHashes, ExpansionOutcome, ExpansionRecord, StorageError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct FileEntry {
    step: Step,
    slots: BTreeSet<u32>,
}

/// Call identity → [`ExpansionRecord`], plus per-file bookkeeping.
///
/// Mutating methods take `&mut self`; shared access goes through
/// [`SharedIndex`](crate::SharedIndex), whose write guard is the single-writer
/// gate for commits.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExpansionIndex {
    records: FxHashMap<CallId, ExpansionRecord>,
    files: FxHashMap<FileId, FileEntry>,
}

impl ExpansionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: CallId) -> Option<&ExpansionRecord> {
        self.records.get(&call)
    }

    /// Whether the recorded expansion was computed from exactly these call and
    /// definition bodies.
    ///
    /// This is the only gate for skipping re-expansion of an unchanged call.
    pub fn is_up_to_date(&self, call: CallId, call_hash: ContentHash, def_hash: ContentHash) -> bool {
        self.records.get(&call).is_some_and(|record| {
            record.hashes.call_hash == call_hash && record.hashes.def_hash == Some(def_hash)
        })
    }

    /// Replace a call's hashes and outcome.
    ///
    /// If the previous outcome's blob is not the new one, the expansion file it
    /// backed is dropped; the nested blobs that became unreachable are returned
    /// for deletion. The previous blob itself is not included.
    pub fn add_expanded_macro(
        &mut self,
        call: CallId,
        hashes: ExpansionHashes,
        outcome: ExpansionOutcome,
        step: Step,
    ) -> Vec<BlobId> {
        let new_blob = outcome.as_ref().ok().map(|out| out.blob);
        let entry = self.files.entry(call.file).or_insert_with(|| FileEntry {
            step,
            slots: BTreeSet::new(),
        });
        entry.slots.insert(call.slot);

        let previous = self.records.insert(
            call,
            ExpansionRecord {
                hashes,
                outcome,
                step,
            },
        );

        match previous.and_then(|record| record.output_blob()) {
            Some(old_blob) if Some(old_blob) != new_blob => self.drop_expansion_file(old_blob),
            _ => Vec::new(),
        }
    }

    /// Drop a call's record.
    ///
    /// Returns the blobs that became unreachable: the nested ones always, and
    /// the record's own blob when `include_own_blob` is set.
    pub fn remove_invalid_info(&mut self, call: CallId, include_own_blob: bool) -> Vec<BlobId> {
        if let Some(entry) = self.files.get_mut(&call.file) {
            entry.slots.remove(&call.slot);
        }
        let Some(record) = self.records.remove(&call) else {
            return Vec::new();
        };
        let Some(blob) = record.output_blob() else {
            return Vec::new();
        };

        let mut orphaned = self.drop_expansion_file(blob);
        if include_own_blob {
            orphaned.insert(0, blob);
        }
        orphaned
    }

    /// Forget a file that no longer owns any records. Returns whether it was removed.
    pub fn remove_source_file_if_empty(&mut self, file: FileId) -> bool {
        match self.files.get(&file) {
            Some(entry) if entry.slots.is_empty() => {
                self.files.remove(&file);
                true
            }
            _ => false,
        }
    }

    /// Re-tag files, and the records they own, with a new step.
    pub fn move_source_files_to_step(&mut self, files: &[FileId], step: Step) {
        for file in files {
            let Some(entry) = self.files.get_mut(file) else {
                continue;
            };
            entry.step = step;
            for &slot in &entry.slots {
                if let Some(record) = self.records.get_mut(&CallId::new(*file, slot)) {
                    record.step = step;
                }
            }
        }
    }

    /// Step a file was last scheduled in.
    pub fn file_step(&self, file: FileId) -> Option<Step> {
        self.files.get(&file).map(|entry| entry.step)
    }

    /// Recorded calls in a file, in slot order.
    pub fn calls_in_file(&self, file: FileId) -> Vec<CallId> {
        self.files.get(&file).map_or_else(Vec::new, |entry| {
            entry
                .slots
                .iter()
                .map(|&slot| CallId::new(file, slot))
                .collect()
        })
    }

    /// Files last scheduled in `step`, sorted.
    pub fn files_in_step(&self, step: Step) -> Vec<FileId> {
        let mut files: Vec<FileId> = self
            .files
            .iter()
            .filter(|(_, entry)| entry.step == step)
            .map(|(&file, _)| file)
            .collect();
        files.sort_unstable();
        files
    }

    /// Every known file, sorted.
    pub fn files(&self) -> Vec<FileId> {
        let mut files: Vec<FileId> = self.files.keys().copied().collect();
        files.sort_unstable();
        files
    }

    /// Calls whose recorded failure must be retried regardless of hashes, sorted.
    pub fn forced_retry_calls(&self) -> Vec<CallId> {
        let mut calls: Vec<CallId> = self
            .records
            .iter()
            .filter(|(_, record)| record.needs_forced_retry())
            .map(|(&call, _)| call)
            .collect();
        calls.sort_unstable();
        calls
    }

    pub fn iter(&self) -> impl Iterator<Item = (CallId, &ExpansionRecord)> + '_ {
        self.records.iter().map(|(&call, record)| (call, record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.files.clear();
    }

    /// Check that the index and the store agree.
    ///
    /// - every `Ok` record names a blob that exists
    /// - no blob is named by two records
    /// - every expansion file with records is backed by a referenced blob
    /// - every blob is named by some record
    pub fn verify(&self, store: &ContentStore) -> Result<(), StorageError> {
        let mut referenced: FxHashSet<BlobId> = FxHashSet::default();
        for (call, record) in &self.records {
            let Some(blob) = record.output_blob() else {
                continue;
            };
            if !store.contains(blob) {
                return Err(StorageError::corrupted(format!(
                    "record for {call} points at missing {blob}"
                )));
            }
            if !referenced.insert(blob) {
                return Err(StorageError::corrupted(format!(
                    "{blob} is referenced by more than one record"
                )));
            }
        }

        for (file, entry) in &self.files {
            if let Some(blob) = file.expansion_blob() {
                if !entry.slots.is_empty() && !referenced.contains(&blob) {
                    return Err(StorageError::corrupted(format!(
                        "{file} owns records but no record produced it"
                    )));
                }
            }
        }

        if let Some(blob) = store.blob_ids().find(|blob| !referenced.contains(blob)) {
            return Err(StorageError::corrupted(format!(
                "{blob} is not referenced by any record"
            )));
        }
        Ok(())
    }

    /// Delete blobs no record references and forget empty files.
    ///
    /// Returns the number of blobs deleted.
    pub fn collect_garbage(&mut self, store: &mut ContentStore) -> usize {
        let referenced: FxHashSet<BlobId> =
            self.records.values().filter_map(ExpansionRecord::output_blob).collect();
        let unreferenced: Vec<BlobId> = store
            .blob_ids()
            .filter(|blob| !referenced.contains(blob))
            .collect();
        for &blob in &unreferenced {
            store.delete(blob);
        }

        self.files.retain(|file, entry| {
            !entry.slots.is_empty()
                && file
                    .expansion_blob()
                    .map_or(true, |blob| referenced.contains(&blob))
        });

        if !unreferenced.is_empty() {
            tracing::debug!(count = unreferenced.len(), "collected unreferenced blobs");
        }
        unreferenced.len()
    }

    /// Remove an expansion file and everything reachable from it.
    fn drop_expansion_file(&mut self, blob: BlobId) -> Vec<BlobId> {
        let mut orphaned = Vec::new();
        let mut worklist = vec![blob];
        while let Some(current) = worklist.pop() {
            let file = FileId::Expansion(current);
            let Some(entry) = self.files.remove(&file) else {
                continue;
            };
            for slot in entry.slots {
                let nested = self
                    .records
                    .remove(&CallId::new(file, slot))
                    .and_then(|record| record.output_blob());
                if let Some(nested) = nested {
                    orphaned.push(nested);
                    worklist.push(nested);
                }
            }
        }
        orphaned
    }
}
