//! One generation of the fixed-point loop.
//!
//! A step:
//! 1. plans its units: pending units from the previous step first, verbatim,
//!    then the host's units minus the slots pending units hold, then forced
//!    retries of non-cacheable failures;
//! 2. runs Stage 1 over the units in parallel chunks, under read locks;
//! 3. runs Stage 2 into one changeset and applies it;
//! 4. runs Stage 3 under the index write lock;
//! 5. reports the calls with live output, which seed the next step.

use mexp_expand::{Expander, SharedExpansionCache};
use mexp_ir::{BlobId, FileId, Step};
use mexp_store::{AppliedChangeset, Changeset, ContentStore, SharedIndex, SharedStore, StorageError};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::EngineConfig;
use crate::host::{ExpansionHost, ExtractError, ExtractableUnit, ExtractedFile, FreshOutput};
use crate::pipeline::{
    commit, invalidate_removed, materialize, resolve_and_expand, BlobTarget, Stage1Context,
    Stage1Result, Stage2Result,
};

/// Counters and hand-off state produced by one step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    pub step: Step,
    /// Units scheduled, pending ones included.
    pub units: usize,
    /// Units carried over from the previous step.
    pub retried: usize,
    /// Units whose file was extracted.
    pub extracted: usize,
    /// Calls whose output bytes were written.
    pub written: usize,
    /// Calls whose metadata moved but whose bytes were unchanged.
    pub refreshed: usize,
    pub noops: usize,
    pub failed: usize,
    pub invalidated: usize,
    /// Blobs deleted because their owner went away.
    pub orphans_deleted: usize,
    /// Units to retry at the start of the next step.
    pub pending: Vec<ExtractableUnit>,
    /// Calls holding a live blob after this step.
    pub fresh: Vec<FreshOutput>,
    /// Files extracted this step.
    pub visited: Vec<FileId>,
}

impl StepReport {
    /// Only carried-over units were scheduled and none of them could be
    /// extracted again.
    pub fn is_stalled(&self) -> bool {
        self.units > 0 && self.extracted == 0 && self.retried == self.units
    }
}

enum UnitOutcome {
    Pending(ExtractableUnit),
    Extracted {
        file: FileId,
        /// The whole file was scanned, not just selected slots.
        whole_file: bool,
        results: Vec<Stage1Result>,
    },
}

/// Drives one step against shared engine state.
pub struct StepRunner<'a> {
    pub host: &'a dyn ExpansionHost,
    pub expander: &'a dyn Expander,
    pub cache: &'a SharedExpansionCache,
    pub index: &'a SharedIndex,
    pub store: &'a SharedStore,
    pub config: &'a EngineConfig,
}

impl StepRunner<'_> {
    /// Run `step`. `pending` are the units the previous step could not extract;
    /// `fresh` is the previous step's live output.
    pub fn run(
        &self,
        step: Step,
        pending: Vec<ExtractableUnit>,
        fresh: &[FreshOutput],
    ) -> Result<StepReport, StorageError> {
        let span = tracing::debug_span!("step", step = step.raw());
        let _enter = span.enter();

        let retried = pending.len();
        let units = self.plan_units(step, pending, fresh);
        let mut report = StepReport {
            step,
            units: units.len(),
            retried,
            ..StepReport::default()
        };
        if units.is_empty() {
            return Ok(report);
        }

        let outcomes = self.extract_and_expand(&units)?;
        let mut results = Vec::new();
        for outcome in outcomes {
            match outcome {
                UnitOutcome::Pending(unit) => report.pending.push(unit),
                UnitOutcome::Extracted {
                    file,
                    whole_file,
                    results: mut unit_results,
                } => {
                    report.extracted += 1;
                    // Forced retries alone do not make a file reachable.
                    if whole_file {
                        report.visited.push(file);
                    }
                    results.append(&mut unit_results);
                }
            }
        }

        let mut changeset = Changeset::new();
        let staged: Vec<Stage2Result> = results
            .into_iter()
            .map(|result| materialize(result, step, &mut changeset))
            .collect();

        self.commit_step(step, changeset, staged, &mut report)?;

        tracing::debug!(
            units = report.units,
            pending = report.pending.len(),
            written = report.written,
            refreshed = report.refreshed,
            noops = report.noops,
            failed = report.failed,
            invalidated = report.invalidated,
            "step finished"
        );
        Ok(report)
    }

    /// Pending units, then host units for the slots pending units do not
    /// hold, then forced retries if the step has any work at all.
    fn plan_units(
        &self,
        step: Step,
        pending: Vec<ExtractableUnit>,
        fresh: &[FreshOutput],
    ) -> Vec<ExtractableUnit> {
        let pending_files: Vec<FileId> = pending.iter().map(|unit| unit.file).collect();
        if !pending_files.is_empty() {
            tracing::debug!(count = pending_files.len(), "retrying pending units");
            self.index.write().move_source_files_to_step(&pending_files, step);
        }

        // Slots pending units hold per file; `None` when they cover it all.
        let mut held: FxHashMap<FileId, Option<Vec<u32>>> = FxHashMap::default();
        for unit in &pending {
            let entry = held.entry(unit.file).or_insert_with(|| Some(Vec::new()));
            match &unit.slots {
                None => *entry = None,
                Some(slots) => {
                    if let Some(taken) = entry {
                        taken.extend(slots.iter().copied());
                    }
                }
            }
        }

        let mut units = pending;
        let pending_count = units.len();
        let mut covered: FxHashSet<FileId> = FxHashSet::default();
        for unit in self.host.units_for_step(step, fresh) {
            if !covered.insert(unit.file) {
                continue;
            }
            match held.get(&unit.file) {
                None => units.push(unit),
                // A pending unit holds some slots; the host's unit takes the rest.
                Some(Some(taken)) => {
                    let rest = unit.without(taken);
                    if rest.selects_any() {
                        units.push(rest);
                    }
                }
                Some(None) => {}
            }
        }
        if units.is_empty() {
            return units;
        }

        let forced = self.index.read().forced_retry_calls();
        for call in forced {
            match units.iter().position(|unit| unit.file == call.file) {
                None => units.push(ExtractableUnit::slots(call.file, vec![call.slot], step)),
                Some(at) if at >= pending_count => {
                    let unit = &mut units[at];
                    if let Some(slots) = unit.slots.as_mut() {
                        if !slots.contains(&call.slot) {
                            slots.push(call.slot);
                        }
                    }
                }
                // Pending units are retried exactly as they were scheduled.
                Some(_) => {}
            }
        }
        units
    }

    fn extract_and_expand(&self, units: &[ExtractableUnit]) -> Result<Vec<UnitOutcome>, StorageError> {
        let index = self.index.read();
        let store = self.store.read();
        let cx = Stage1Context {
            host: self.host,
            expander: self.expander,
            cache: self.cache,
            index: &index,
            store: &store,
        };

        if self.config.parallel {
            units
                .par_chunks(self.config.effective_chunk_size())
                .flat_map_iter(|chunk| chunk.iter().map(|unit| self.process_unit(&cx, unit)))
                .collect()
        } else {
            units.iter().map(|unit| self.process_unit(&cx, unit)).collect()
        }
    }

    fn process_unit(
        &self,
        cx: &Stage1Context<'_>,
        unit: &ExtractableUnit,
    ) -> Result<UnitOutcome, StorageError> {
        let extracted = match self.extract_with_retry(unit, cx.store) {
            Ok(extracted) => extracted,
            Err(reason) => {
                tracing::debug!(file = %unit.file, %reason, "unit deferred");
                return Ok(UnitOutcome::Pending(unit.clone()));
            }
        };

        let mut results = Vec::new();
        for call in extracted.calls.iter().filter(|call| unit.selects(call.id.slot)) {
            results.push(resolve_and_expand(cx, call)?);
        }

        // Records for calls the host no longer reports belong to removed
        // calls. A slot-restricted unit only speaks for its selected slots.
        let live: FxHashSet<u32> = extracted.calls.iter().map(|call| call.id.slot).collect();
        for call in cx.index.calls_in_file(unit.file) {
            if unit.selects(call.slot) && !live.contains(&call.slot) {
                results.push(invalidate_removed(cx, call)?);
            }
        }

        Ok(UnitOutcome::Extracted {
            file: unit.file,
            whole_file: unit.slots.is_none(),
            results,
        })
    }

    fn extract_with_retry(
        &self,
        unit: &ExtractableUnit,
        store: &ContentStore,
    ) -> Result<ExtractedFile, ExtractError> {
        if !self.host.is_consistent() {
            return Err(ExtractError::NotReady);
        }
        let mut attempts = 0;
        loop {
            match self.host.extract(unit, store) {
                Err(ExtractError::ReadDenied) if attempts < self.config.read_retries => {
                    attempts += 1;
                    std::thread::yield_now();
                }
                result => return result,
            }
        }
    }

    fn commit_step(
        &self,
        step: Step,
        changeset: Changeset,
        staged: Vec<Stage2Result>,
        report: &mut StepReport,
    ) -> Result<(), StorageError> {
        let mut index = self.index.write();
        let mut store = self.store.write();

        let applied = if changeset.is_empty() {
            AppliedChangeset::default()
        } else {
            store.apply(changeset)?
        };

        let mut orphaned: Vec<BlobId> = Vec::new();
        let mut dead: FxHashSet<BlobId> = FxHashSet::default();
        for result in staged {
            if let Some(owner) = result.call().file.expansion_blob() {
                // The expansion file holding this call was dropped earlier in
                // this commit; its results have nowhere to go.
                if dead.contains(&owner) || !store.contains(owner) {
                    if let Stage2Result::Write {
                        target: BlobTarget::Created(ticket),
                        ..
                    } = &result
                    {
                        orphaned.extend(applied.blob(*ticket));
                    }
                    continue;
                }
            }

            match &result {
                Stage2Result::NoOp { .. } => report.noops += 1,
                Stage2Result::Invalidate { .. } => report.invalidated += 1,
                Stage2Result::Write { rewritten, .. } => {
                    if *rewritten {
                        report.written += 1;
                    } else {
                        report.refreshed += 1;
                    }
                }
                Stage2Result::Fail { .. } => report.failed += 1,
            }

            let outcome = commit(result, &applied, step, &mut index, &store)?;
            dead.extend(outcome.orphaned.iter().copied());
            orphaned.extend(outcome.orphaned);
            report.fresh.extend(outcome.fresh);
        }

        for blob in orphaned {
            if store.delete(blob) {
                report.orphans_deleted += 1;
            }
        }
        report.fresh.retain(|fresh| store.contains(fresh.blob));
        report.fresh.sort_unstable();
        Ok(())
    }
}
