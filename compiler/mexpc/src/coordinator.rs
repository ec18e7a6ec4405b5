//! The fixed-point loop over steps.
//!
//! # States
//!
//! ```text
//! Idle ──► Stepping(0) ──► Stepping(1) ──► ... ──► Done(outcome)
//!               │               │
//!               └───────────────┴──────────────► Failed(reason)
//! ```
//!
//! A step whose unit list is empty ends the run with [`RunOutcome::Done`].
//! Reaching the recursion limit, observing cancellation at a step boundary,
//! or a step whose carried-over units still cannot be extracted also end the
//! run, without error. Storage corruption ends it with [`EngineError::Storage`] and makes
//! the next run start from a clean slate.
//!
//! # Threads
//!
//! Each step's parallel phase is submitted to a worker pool and reports back
//! over a channel. The coordinating thread waits on that channel with a
//! periodic tick, reporting progress and noticing cancellation, but a
//! submitted step always runs to its commit: a changeset applied without the
//! matching index commit would leave unreferenced blobs behind.

use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, RecvTimeoutError};
use mexp_expand::{CacheStats, Expander, SharedExpansionCache};
use mexp_ir::{FileId, Step};
use mexp_store::{
    ContentStore, ExpansionIndex, IndexSnapshot, SharedIndex, SharedStore, StorageError,
};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::config::EngineConfig;
use crate::host::{ExpansionHost, ExtractableUnit, FreshOutput};
use crate::progress::{CancellationToken, ProgressSink, ProgressTracker};
use crate::step::{StepReport, StepRunner};

/// How a run ended.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum RunOutcome {
    /// A step found nothing to do.
    #[default]
    Done,
    /// The recursion limit stopped the loop; the deepest calls may be stale.
    RecursionLimit,
    /// Cancellation was observed at a step boundary.
    Cancelled,
    /// Units deferred by the host stayed unextractable for a second step;
    /// they are kept for the next run.
    Stalled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Done => write!(f, "done"),
            RunOutcome::RecursionLimit => write!(f, "stopped at recursion limit"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Stalled => write!(f, "stalled"),
        }
    }
}

/// Where the coordinator is in its state machine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Stepping(Step),
    Done(RunOutcome),
    /// The last run aborted; the next run starts from a clean slate.
    Failed(FailureReason),
}

/// Why a run aborted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The index and the content store disagreed.
    StorageCorrupted,
    /// Reading or writing persisted state failed.
    Storage,
    /// A step panicked on a worker thread.
    WorkerPanicked,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StorageCorrupted => write!(f, "storage corrupted"),
            FailureReason::Storage => write!(f, "storage error"),
            FailureReason::WorkerPanicked => write!(f, "worker panicked"),
        }
    }
}

/// Summary of one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Steps that had at least one unit.
    pub steps: usize,
    /// Calls whose output bytes were written.
    pub written: usize,
    /// Calls whose metadata changed over byte-identical output.
    pub refreshed: usize,
    pub noops: usize,
    pub failed: usize,
    pub invalidated: usize,
    /// Units carried over to the next run.
    pub pending: usize,
    /// Blobs deleted by garbage collection and orphan cleanup.
    pub collected: usize,
    /// Live blobs per allocating step after the run.
    pub blobs_per_step: Vec<usize>,
    pub cache: CacheStats,
    /// The host was switched into heavy mode during the run.
    pub heavy_mode: bool,
}

impl RunReport {
    fn absorb(&mut self, step: &StepReport) {
        self.steps += 1;
        self.written += step.written;
        self.refreshed += step.refreshed;
        self.noops += step.noops;
        self.failed += step.failed;
        self.invalidated += step.invalidated;
        self.collected += step.orphans_deleted;
    }

    /// Calls whose record changed during the run.
    pub fn changes(&self) -> usize {
        self.written + self.refreshed + self.failed + self.invalidated
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} step{}: {} written, {} refreshed, {} unchanged, {} failed, {} invalidated, {} pending",
            self.outcome,
            self.steps,
            if self.steps == 1 { "" } else { "s" },
            self.written,
            self.refreshed,
            self.noops,
            self.failed,
            self.invalidated,
            self.pending,
        )
    }
}

/// Errors that abort a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineError {
    /// `run` was called while another run is in progress.
    AlreadyRunning,
    /// The index and the content store disagree.
    Storage(StorageError),
    /// A step panicked on a worker thread.
    WorkerPanicked(String),
}

impl EngineError {
    /// The reason recorded in [`RunState::Failed`]. `None` for a rejected
    /// concurrent call, which leaves the running state alone.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            EngineError::AlreadyRunning => None,
            EngineError::Storage(err) if err.is_corruption() => Some(FailureReason::StorageCorrupted),
            EngineError::Storage(_) => Some(FailureReason::Storage),
            EngineError::WorkerPanicked(_) => Some(FailureReason::WorkerPanicked),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::AlreadyRunning => write!(f, "an expansion run is already in progress"),
            EngineError::Storage(err) => write!(f, "{err}"),
            EngineError::WorkerPanicked(message) => write!(f, "expansion step panicked: {message}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage(err)
    }
}

/// State handed from one run to the next.
#[derive(Debug, Default)]
struct CarryOver {
    pending: Vec<ExtractableUnit>,
    clean_start: bool,
}

/// Owns the engine state and runs the step loop.
pub struct ExpansionCoordinator<H, E> {
    host: H,
    expander: E,
    cache: SharedExpansionCache,
    index: SharedIndex,
    store: SharedStore,
    config: EngineConfig,
    running: AtomicBool,
    state: Mutex<RunState>,
    carry: Mutex<CarryOver>,
}

impl<H: ExpansionHost, E: Expander> ExpansionCoordinator<H, E> {
    pub fn new(host: H, expander: E, cache: SharedExpansionCache, config: EngineConfig) -> Self {
        ExpansionCoordinator {
            host,
            expander,
            cache,
            index: SharedIndex::default(),
            store: SharedStore::default(),
            config,
            running: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
            carry: Mutex::new(CarryOver::default()),
        }
    }

    /// Resume from persisted state.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: IndexSnapshot) -> Self {
        self.index = SharedIndex::new(snapshot.index);
        self.store = SharedStore::new(snapshot.store);
        self.carry.get_mut().clean_start = snapshot.clean_start;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn expander(&self) -> &E {
        &self.expander
    }

    pub fn cache(&self) -> &SharedExpansionCache {
        &self.cache
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Units the last run left for the next one.
    pub fn pending_units(&self) -> Vec<ExtractableUnit> {
        self.carry.lock().pending.clone()
    }

    /// Make the next run discard all incremental state first.
    pub fn request_clean_start(&self) {
        self.carry.lock().clean_start = true;
    }

    pub fn clean_start_requested(&self) -> bool {
        self.carry.lock().clean_start
    }

    /// Persist the index and store, along with a pending clean-start request.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StorageError> {
        let clean_start = self.clean_start_requested();
        let index = self.index.read();
        let store = self.store.read();
        IndexSnapshot::save(path, &index, &store, clean_start)
    }

    /// Run the step loop to a fixed point.
    ///
    /// Not reentrant: a concurrent second call returns
    /// [`EngineError::AlreadyRunning`].
    pub fn run(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let span = tracing::info_span!("expansion_run");
        let _enter = span.enter();

        let result = self.run_steps(cancel, progress);
        let state = match &result {
            Ok(report) => RunState::Done(report.outcome),
            Err(err) => RunState::Failed(err.reason().unwrap_or(FailureReason::Storage)),
        };
        *self.state.lock() = state;
        result
    }

    fn run_steps(
        &self,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunReport, EngineError> {
        let mut pending = self.prepare()?;
        self.warm_up();

        let runner = StepRunner {
            host: &self.host,
            expander: &self.expander,
            cache: &self.cache,
            index: &self.index,
            store: &self.store,
            config: &self.config,
        };
        let pool = self.build_pool();
        let mut heavy = HeavyMode::new(&self.host, self.config.heavy_threshold);
        let mut tracker = ProgressTracker::new();
        let mut report = RunReport::default();
        let mut fresh: Vec<FreshOutput> = Vec::new();
        let mut visited: FxHashSet<FileId> = FxHashSet::default();
        let limit = self.config.limit();
        let mut step = Step::ZERO;

        let outcome = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            if step > limit {
                if fresh.is_empty() && pending.is_empty() {
                    break RunOutcome::Done;
                }
                tracing::info!(%step, "recursion limit reached");
                break RunOutcome::RecursionLimit;
            }

            *self.state.lock() = RunState::Stepping(step);
            tracker.start_step(step);
            progress.report(tracker.fraction(), &phase_text(step));

            let units = mem::take(&mut pending);
            let step_report = self
                .execute_step(pool.as_ref(), &runner, step, units, &fresh, cancel, &mut tracker, progress)
                .map_err(|err| self.abort(err))?;
            tracker.finish_step();

            if step_report.units == 0 {
                break RunOutcome::Done;
            }
            report.absorb(&step_report);
            heavy.observe(step_report.written);
            visited.extend(step_report.visited.iter().copied());
            let stalled = step_report.is_stalled();
            pending = step_report.pending;
            fresh = step_report.fresh;
            if stalled {
                tracing::info!(%step, pending = pending.len(), "deferred units are still not ready");
                break RunOutcome::Stalled;
            }
            step = step.next();
        };

        {
            let mut index = self.index.write();
            let mut store = self.store.write();
            if outcome == RunOutcome::Done && pending.is_empty() {
                let (invalidated, deleted) = sweep_unreachable(&mut index, &mut store, &visited);
                report.invalidated += invalidated;
                report.collected += deleted;
            }
            report.collected += index.collect_garbage(&mut store);
            report.blobs_per_step = store.step_histogram();
        }

        report.outcome = outcome;
        report.pending = pending.len();
        report.cache = self.cache.stats();
        report.heavy_mode = heavy.entered();
        self.carry.lock().pending = pending;

        tracker.finish();
        progress.report(tracker.fraction(), "Macro expansion finished");
        tracing::info!(
            outcome = %report.outcome,
            steps = report.steps,
            written = report.written,
            noops = report.noops,
            failed = report.failed,
            pending = report.pending,
            "expansion run finished"
        );
        Ok(report)
    }

    /// Honour a clean-start request, or check that the index and store agree.
    /// Returns the units carried over from the previous run.
    fn prepare(&self) -> Result<Vec<ExtractableUnit>, EngineError> {
        let (pending, clean_start) = {
            let mut carry = self.carry.lock();
            (mem::take(&mut carry.pending), mem::take(&mut carry.clean_start))
        };

        if clean_start {
            tracing::warn!("discarding incremental state from a corrupted run");
            self.index.write().clear();
            self.store.write().clear();
            self.cache.clear();
            return Ok(Vec::new());
        }

        if self.config.verify_on_start {
            let verified = {
                let index = self.index.read();
                let store = self.store.read();
                index.verify(&store)
            };
            verified.map_err(|err| self.abort(EngineError::Storage(err)))?;
        }
        Ok(pending)
    }

    /// Run the host's best-effort pass. It must not keep expansion from
    /// proceeding, so errors and panics are only logged.
    fn warm_up(&self) {
        match catch_unwind(AssertUnwindSafe(|| self.host.warm_up())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "warm-up pass failed"),
            Err(payload) => {
                tracing::warn!(panic = panic_message(&*payload), "warm-up pass panicked");
            }
        }
    }

    fn build_pool(&self) -> Option<rayon::ThreadPool> {
        let threads = if self.config.parallel {
            self.config.effective_jobs()
        } else {
            1
        };
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mexp-worker-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(e) => {
                tracing::warn!("failed to create thread pool ({e}), running steps inline");
                None
            }
        }
    }

    /// Submit one step to the pool and wait for it, ticking progress.
    #[expect(
        clippy::too_many_arguments,
        reason = "the wait loop needs the step inputs and the run's reporting state"
    )]
    fn execute_step(
        &self,
        pool: Option<&rayon::ThreadPool>,
        runner: &StepRunner<'_>,
        step: Step,
        pending: Vec<ExtractableUnit>,
        fresh: &[FreshOutput],
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
        progress: &dyn ProgressSink,
    ) -> Result<StepReport, EngineError> {
        let Some(pool) = pool else {
            return run_guarded(runner, step, pending, fresh);
        };

        let (tx, rx) = channel::bounded(1);
        pool.in_place_scope(|scope| {
            scope.spawn(move |_| {
                // The receiver lives until the scope ends.
                let _ = tx.send(run_guarded(runner, step, pending, fresh));
            });

            let mut announced = false;
            loop {
                match rx.recv_timeout(self.config.tick) {
                    Ok(result) => return result,
                    Err(RecvTimeoutError::Timeout) => {
                        tracker.tick();
                        progress.report(tracker.fraction(), &phase_text(step));
                        if cancel.is_cancelled() && !announced {
                            announced = true;
                            tracing::debug!(%step, "cancellation requested; finishing the step first");
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(EngineError::WorkerPanicked(
                            "step worker exited without a result".to_string(),
                        ));
                    }
                }
            }
        })
    }

    /// Record a fatal error. Anything that aborts a step may have left the
    /// index and store out of step, so the next run starts clean.
    fn abort(&self, err: EngineError) -> EngineError {
        tracing::error!(error = %err, "expansion run aborted; the next run starts from scratch");
        self.carry.lock().clean_start = true;
        err
    }
}

impl<H, E> fmt::Debug for ExpansionCoordinator<H, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpansionCoordinator")
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tracks whether the host was switched into heavy mode and switches it back
/// when the run ends.
struct HeavyMode<'a, H: ExpansionHost> {
    host: &'a H,
    threshold: usize,
    active: bool,
}

impl<'a, H: ExpansionHost> HeavyMode<'a, H> {
    fn new(host: &'a H, threshold: usize) -> Self {
        HeavyMode {
            host,
            threshold,
            active: false,
        }
    }

    fn observe(&mut self, written: usize) {
        if !self.active && written >= self.threshold {
            tracing::debug!(written, "entering heavy mode");
            self.active = true;
            self.host.heavy_mode(true);
        }
    }

    fn entered(&self) -> bool {
        self.active
    }
}

impl<H: ExpansionHost> Drop for HeavyMode<'_, H> {
    fn drop(&mut self) {
        if self.active {
            self.host.heavy_mode(false);
        }
    }
}

fn run_guarded(
    runner: &StepRunner<'_>,
    step: Step,
    pending: Vec<ExtractableUnit>,
    fresh: &[FreshOutput],
) -> Result<StepReport, EngineError> {
    match catch_unwind(AssertUnwindSafe(|| runner.run(step, pending, fresh))) {
        Ok(result) => result.map_err(EngineError::Storage),
        Err(payload) => Err(EngineError::WorkerPanicked(panic_message(&*payload).to_string())),
    }
}

/// Drop every record in a file the run never reached, with its output.
///
/// Returns the number of records dropped and blobs deleted.
fn sweep_unreachable(
    index: &mut ExpansionIndex,
    store: &mut ContentStore,
    visited: &FxHashSet<FileId>,
) -> (usize, usize) {
    let mut invalidated = 0;
    let mut deleted = 0;
    for file in index.files() {
        if visited.contains(&file) || index.file_step(file).is_none() {
            continue;
        }
        for call in index.calls_in_file(file) {
            if index.record(call).is_none() {
                continue;
            }
            invalidated += 1;
            for blob in index.remove_invalid_info(call, true) {
                if store.delete(blob) {
                    deleted += 1;
                }
            }
        }
        index.remove_source_file_if_empty(file);
    }
    if invalidated > 0 {
        tracing::debug!(invalidated, deleted, "dropped records of unreachable files");
    }
    (invalidated, deleted)
}

fn phase_text(step: Step) -> String {
    format!("Expanding macros ({step})")
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
