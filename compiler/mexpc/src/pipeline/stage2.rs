//! Stage 2: turn Stage 1 decisions into blob operations.

use mexp_ir::{BlobId, CallId, ContentHash, ExpansionPipelineError, RangeMap, Step};
use mexp_store::{ChangeTicket, Changeset, ExpansionHashes};

use super::Stage1Result;

/// Where a written call's output will live once the changeset is applied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlobTarget {
    /// An existing blob, kept under the same id.
    Existing(BlobId),
    /// A blob the changeset allocates.
    Created(ChangeTicket),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage2Result {
    NoOp {
        call: CallId,
        blob: Option<BlobId>,
    },
    Invalidate {
        call: CallId,
    },
    Write {
        call: CallId,
        hashes: ExpansionHashes,
        target: BlobTarget,
        ranges: RangeMap,
        content_hash: ContentHash,
        /// Bytes were written (as opposed to a ranges-only refresh).
        rewritten: bool,
    },
    Fail {
        call: CallId,
        hashes: ExpansionHashes,
        error: ExpansionPipelineError,
    },
}

impl Stage2Result {
    pub fn call(&self) -> CallId {
        match self {
            Stage2Result::NoOp { call, .. }
            | Stage2Result::Invalidate { call }
            | Stage2Result::Write { call, .. }
            | Stage2Result::Fail { call, .. } => *call,
        }
    }
}

/// Queue the blob operations for one Stage 1 result.
pub fn materialize(result: Stage1Result, step: Step, changeset: &mut Changeset) -> Stage2Result {
    match result {
        Stage1Result::NoOp { call, blob } => Stage2Result::NoOp { call, blob },
        Stage1Result::Invalidate { call, blob } => {
            if let Some(blob) = blob {
                changeset.delete(blob);
            }
            Stage2Result::Invalidate { call }
        }
        Stage1Result::RangesOnly {
            call,
            hashes,
            blob,
            ranges,
            content_hash,
        } => {
            changeset.touch(blob);
            Stage2Result::Write {
                call,
                hashes,
                target: BlobTarget::Existing(blob),
                ranges,
                content_hash,
                rewritten: false,
            }
        }
        Stage1Result::NewOutput {
            call,
            hashes,
            previous,
            text,
            ranges,
            content_hash,
        } => {
            let bytes = text.into_bytes();
            let target = match previous {
                Some(blob) => {
                    changeset.overwrite(blob, bytes);
                    BlobTarget::Existing(blob)
                }
                None => BlobTarget::Created(changeset.create(step, bytes)),
            };
            Stage2Result::Write {
                call,
                hashes,
                target,
                ranges,
                content_hash,
                rewritten: true,
            }
        }
        Stage1Result::Fail {
            call,
            hashes,
            error,
            previous,
        } => {
            if let Some(blob) = previous {
                changeset.delete(blob);
            }
            Stage2Result::Fail {
                call,
                hashes,
                error,
            }
        }
    }
}
