//! Progress reporting and cooperative cancellation.
//!
//! The number of macro calls in a project is not known up front, so progress
//! is assembled from a fixed weight per step index rather than a unit count.
//! Early steps carry most of the weight.

#![expect(
    clippy::disallowed_types,
    reason = "Arc is the implementation of CancellationToken"
)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mexp_ir::Step;

/// Weights of the first steps. Later steps share what is left, each taking
/// half of the remainder.
const STEP_WEIGHTS: [f64; 6] = [0.40, 0.22, 0.14, 0.09, 0.06, 0.04];

/// Fraction reserved for steps beyond [`STEP_WEIGHTS`].
const TAIL_WEIGHT: f64 = 0.04;

/// Share of a step's weight that ticks may fill before the step completes.
const TICK_CEILING: f64 = 0.9;

/// Weight of one step.
pub fn step_weight(step: Step) -> f64 {
    match STEP_WEIGHTS.get(step.index()) {
        Some(&weight) => weight,
        None => {
            let beyond = step.index() - STEP_WEIGHTS.len();
            let exponent = i32::try_from(beyond + 1).unwrap_or(i32::MAX);
            TAIL_WEIGHT * 0.5_f64.powi(exponent)
        }
    }
}

/// Receives progress from a running coordinator.
pub trait ProgressSink {
    /// `fraction` is in `0.0..=1.0` and never decreases within a run.
    fn report(&self, fraction: f64, phase: &str);
}

impl<F: Fn(f64, &str)> ProgressSink for F {
    fn report(&self, fraction: f64, phase: &str) {
        self(fraction, phase);
    }
}

/// A sink that discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64, _phase: &str) {}
}

/// Monotone progress over the steps of one run.
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker {
    completed: f64,
    current: Option<Step>,
    ticks: u32,
    last: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_step(&mut self, step: Step) {
        self.current = Some(step);
        self.ticks = 0;
    }

    /// A wait interval passed while the current step runs.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.saturating_add(1);
    }

    pub fn finish_step(&mut self) {
        if let Some(step) = self.current.take() {
            self.completed += step_weight(step);
        }
        self.ticks = 0;
    }

    /// The run is over.
    pub fn finish(&mut self) {
        self.current = None;
        self.last = 1.0;
    }

    /// Current fraction. Never decreases.
    pub fn fraction(&mut self) -> f64 {
        let partial = match self.current {
            Some(step) => {
                let ticks = f64::from(self.ticks);
                step_weight(step) * TICK_CEILING * ticks / (ticks + 4.0)
            }
            None => 0.0,
        };
        let value = (self.completed + partial).min(1.0);
        if value > self.last {
            self.last = value;
        }
        self.last
    }
}

/// Cooperative cancellation flag shared between a run and its caller.
///
/// The coordinator checks it at step boundaries; a step that has started
/// always runs to its commit.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
