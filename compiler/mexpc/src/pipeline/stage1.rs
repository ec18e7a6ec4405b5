//! Stage 1: resolve a call and obtain its expansion.

use mexp_expand::{mix_hash, Expander, SharedExpansionCache};
use mexp_ir::{hash_bytes, BlobId, CallId, ContentHash, ExpansionPipelineError, RangeMap};
use mexp_store::{ContentStore, ExpansionHashes, ExpansionIndex, ExpansionRecord, StorageError};

use crate::host::{Capability, ExpansionHost, MacroCall};

/// Read-only view of everything Stage 1 consults.
#[derive(Copy, Clone)]
pub struct Stage1Context<'a> {
    pub host: &'a dyn ExpansionHost,
    pub expander: &'a dyn Expander,
    pub cache: &'a SharedExpansionCache,
    pub index: &'a ExpansionIndex,
    pub store: &'a ContentStore,
}

/// What Stage 1 decided for one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stage1Result {
    /// Nothing to write. `blob` is the call's current output, if any.
    NoOp { call: CallId, blob: Option<BlobId> },
    /// The call is gone: drop its record and output.
    Invalidate { call: CallId, blob: Option<BlobId> },
    /// Output bytes are unchanged; only metadata moves.
    RangesOnly {
        call: CallId,
        hashes: ExpansionHashes,
        blob: BlobId,
        ranges: RangeMap,
        content_hash: ContentHash,
    },
    /// Output bytes changed or are new.
    NewOutput {
        call: CallId,
        hashes: ExpansionHashes,
        previous: Option<BlobId>,
        text: String,
        ranges: RangeMap,
        content_hash: ContentHash,
    },
    /// The call failed; its previous output must go.
    Fail {
        call: CallId,
        hashes: ExpansionHashes,
        error: ExpansionPipelineError,
        previous: Option<BlobId>,
    },
}

impl Stage1Result {
    pub fn call(&self) -> CallId {
        match self {
            Stage1Result::NoOp { call, .. }
            | Stage1Result::Invalidate { call, .. }
            | Stage1Result::RangesOnly { call, .. }
            | Stage1Result::NewOutput { call, .. }
            | Stage1Result::Fail { call, .. } => *call,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Stage1Result::NoOp { .. })
    }
}

/// Run Stage 1 for one call.
///
/// Per-call problems become [`Stage1Result::Fail`]; only an index record
/// whose blob is missing from the store is an error.
pub fn resolve_and_expand(
    cx: &Stage1Context<'_>,
    call: &MacroCall,
) -> Result<Stage1Result, StorageError> {
    let id = call.id;
    let previous = live_record(cx, id)?;
    let previous_blob = previous.and_then(ExpansionRecord::output_blob);

    if !call.is_valid() {
        return Ok(match previous {
            Some(_) => Stage1Result::Invalidate {
                call: id,
                blob: previous_blob,
            },
            None => Stage1Result::NoOp {
                call: id,
                blob: None,
            },
        });
    }

    let unresolved = ExpansionHashes::call_only(call.body_hash);
    if !call.is_cfg_enabled() {
        return Ok(fail(previous, id, unresolved, ExpansionPipelineError::CfgDisabled));
    }
    match cx.host.capability(call) {
        Capability::Enabled => {}
        Capability::Absent => {
            return Ok(fail(previous, id, unresolved, ExpansionPipelineError::Skipped));
        }
        Capability::Off => {
            return Ok(fail(previous, id, unresolved, ExpansionPipelineError::ExpansionDisabled));
        }
    }

    let def = match cx.host.resolve(call) {
        Ok(def) => def,
        Err(err) => {
            let error = ExpansionPipelineError::Unresolved {
                kind: err.kind,
                transient: err.transient,
            };
            return Ok(fail(previous, id, unresolved, error));
        }
    };

    let resolved_only = ExpansionHashes {
        call_hash: call.body_hash,
        def_hash: Some(def.body_hash),
        mix_hash: None,
    };
    let Some(call_data) = cx.expander.normalize_call(&call.body) else {
        return Ok(fail(previous, id, resolved_only, ExpansionPipelineError::MacroCallSyntax));
    };
    let Some(def_data) = cx.expander.normalize_def(&def.body) else {
        return Ok(fail(previous, id, resolved_only, ExpansionPipelineError::MacroDefSyntax));
    };
    let mix = mix_hash(&def_data, &call_data, call.body_hash);
    let hashes = ExpansionHashes::resolved(call.body_hash, def.body_hash, mix);

    let forced = previous.is_some_and(ExpansionRecord::needs_forced_retry);
    if !forced && cx.index.is_up_to_date(id, call.body_hash, def.body_hash) {
        return Ok(Stage1Result::NoOp {
            call: id,
            blob: previous_blob,
        });
    }

    let expansion = match cx.cache.get_expansion_if_cached(mix) {
        Some(cached) => cached,
        None => cx.cache.cached_expand(cx.expander, &def_data, &call_data, mix),
    };
    let expansion = match expansion {
        Ok(expansion) => expansion,
        Err(err) => {
            tracing::debug!(call = %id, error = %err, "expansion failed");
            return Ok(fail(previous, id, hashes, ExpansionPipelineError::Expansion(err)));
        }
    };

    let content_hash = hash_bytes(expansion.text.as_bytes());
    if let Some(blob) = previous_blob {
        if cx.store.read(blob) == Some(expansion.text.as_bytes()) {
            return Ok(Stage1Result::RangesOnly {
                call: id,
                hashes,
                blob,
                ranges: expansion.ranges.clone(),
                content_hash,
            });
        }
    }
    Ok(Stage1Result::NewOutput {
        call: id,
        hashes,
        previous: previous_blob,
        text: expansion.text.clone(),
        ranges: expansion.ranges.clone(),
        content_hash,
    })
}

/// Invalidation of a recorded call the host no longer reports.
pub fn invalidate_removed(
    cx: &Stage1Context<'_>,
    call: CallId,
) -> Result<Stage1Result, StorageError> {
    let blob = live_record(cx, call)?.and_then(ExpansionRecord::output_blob);
    Ok(Stage1Result::Invalidate { call, blob })
}

/// The call's record, checked against the store.
fn live_record<'a>(
    cx: &Stage1Context<'a>,
    call: CallId,
) -> Result<Option<&'a ExpansionRecord>, StorageError> {
    let record = cx.index.record(call);
    if let Some(blob) = record.and_then(ExpansionRecord::output_blob) {
        if !cx.store.contains(blob) {
            tracing::error!(%call, %blob, "index record points at missing output");
            return Err(StorageError::corrupted(format!(
                "record for {call} points at missing {blob}"
            )));
        }
    }
    Ok(record)
}

/// A failure result, or `NoOp` when the record already says exactly this.
fn fail(
    previous: Option<&ExpansionRecord>,
    call: CallId,
    hashes: ExpansionHashes,
    error: ExpansionPipelineError,
) -> Stage1Result {
    match previous {
        Some(record) if record.hashes == hashes && record.error() == Some(&error) => {
            Stage1Result::NoOp { call, blob: None }
        }
        _ => Stage1Result::Fail {
            call,
            hashes,
            previous: previous.and_then(ExpansionRecord::output_blob),
            error,
        },
    }
}
