//! Stage 3: commit results to the index.

use mexp_ir::{BlobId, Step};
use mexp_store::{AppliedChangeset, ContentStore, ExpandedOutput, ExpansionIndex, StorageError};

use super::{BlobTarget, Stage2Result};
use crate::host::FreshOutput;

/// What committing one result produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// The call's live blob after the commit.
    pub fresh: Option<FreshOutput>,
    /// Nested blobs made unreachable by the commit; the caller deletes them.
    pub orphaned: Vec<BlobId>,
}

/// Commit one result. Must run after the step's changeset was applied, under
/// the index write lock.
pub fn commit(
    result: Stage2Result,
    applied: &AppliedChangeset,
    step: Step,
    index: &mut ExpansionIndex,
    store: &ContentStore,
) -> Result<CommitOutcome, StorageError> {
    match result {
        Stage2Result::NoOp { call, blob } => Ok(CommitOutcome {
            fresh: blob.map(|blob| FreshOutput { call, blob, step }),
            orphaned: Vec::new(),
        }),
        Stage2Result::Invalidate { call } => {
            let orphaned = index.remove_invalid_info(call, false);
            index.remove_source_file_if_empty(call.file);
            Ok(CommitOutcome {
                fresh: None,
                orphaned,
            })
        }
        Stage2Result::Write {
            call,
            hashes,
            target,
            ranges,
            content_hash,
            rewritten: _,
        } => {
            let blob = match target {
                BlobTarget::Existing(blob) => blob,
                BlobTarget::Created(ticket) => applied.blob(ticket).ok_or_else(|| {
                    StorageError::corrupted(format!("no blob allocated for {call}"))
                })?,
            };
            let output = ExpandedOutput {
                blob,
                ranges,
                content_hash,
            };
            let orphaned = index.add_expanded_macro(call, hashes, Ok(output), step);
            store.sync_view(blob);
            Ok(CommitOutcome {
                fresh: Some(FreshOutput { call, blob, step }),
                orphaned,
            })
        }
        Stage2Result::Fail {
            call,
            hashes,
            error,
        } => {
            let orphaned = index.add_expanded_macro(call, hashes, Err(error), step);
            Ok(CommitOutcome {
                fresh: None,
                orphaned,
            })
        }
    }
}
