//! Persisted metadata for one macro call's last known expansion.

use mexp_ir::{BlobId, ContentHash, ExpansionPipelineError, RangeMap, Step};
use serde::{Deserialize, Serialize};

/// Hashes that decide whether a call needs re-expansion.
///
/// `def_hash` and `mix_hash` are `None` when resolution never succeeded for
/// the recorded outcome, so such a record is never up to date.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpansionHashes {
    pub call_hash: ContentHash,
    pub def_hash: Option<ContentHash>,
    pub mix_hash: Option<ContentHash>,
}

impl ExpansionHashes {
    /// Hashes for a call whose definition was never resolved.
    pub const fn call_only(call_hash: ContentHash) -> Self {
        ExpansionHashes {
            call_hash,
            def_hash: None,
            mix_hash: None,
        }
    }

    pub const fn resolved(call_hash: ContentHash, def_hash: ContentHash, mix_hash: ContentHash) -> Self {
        ExpansionHashes {
            call_hash,
            def_hash: Some(def_hash),
            mix_hash: Some(mix_hash),
        }
    }
}

/// Successful expansion: where the text lives and how it maps back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpandedOutput {
    pub blob: BlobId,
    pub ranges: RangeMap,
    pub content_hash: ContentHash,
}

pub type ExpansionOutcome = Result<ExpandedOutput, ExpansionPipelineError>;

/// The last known expansion of one macro call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    pub hashes: ExpansionHashes,
    pub outcome: ExpansionOutcome,
    /// Step of the file that owned the call when the record was committed.
    pub step: Step,
}

impl ExpansionRecord {
    pub fn output(&self) -> Option<&ExpandedOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn output_blob(&self) -> Option<BlobId> {
        self.output().map(|out| out.blob)
    }

    pub fn error(&self) -> Option<&ExpansionPipelineError> {
        self.outcome.as_ref().err()
    }

    /// A non-cacheable failure must be retried even with unchanged hashes.
    pub fn needs_forced_retry(&self) -> bool {
        self.error().is_some_and(|err| !err.is_cacheable())
    }
}
