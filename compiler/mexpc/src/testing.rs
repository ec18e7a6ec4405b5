//! Expanders for exercising the engine.
//!
//! Both wrap [`TemplateExpander`] and observe or perturb how often it runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mexp_expand::{Expander, Expansion, MacroCallData, MacroDefData, TemplateExpander};
use mexp_ir::{ExpansionError, ExpansionErrorKind};

/// Counts calls to [`Expander::expand`].
#[derive(Debug, Default)]
pub struct CountingExpander {
    inner: TemplateExpander,
    expansions: AtomicUsize,
}

impl CountingExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expansions(&self) -> usize {
        self.expansions.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.expansions.store(0, Ordering::Relaxed);
    }
}

impl Expander for CountingExpander {
    fn normalize_def(&self, body: &str) -> Option<MacroDefData> {
        self.inner.normalize_def(body)
    }

    fn normalize_call(&self, body: &str) -> Option<MacroCallData> {
        self.inner.normalize_call(body)
    }

    fn expand(&self, def: &MacroDefData, call: &MacroCallData) -> Result<Expansion, ExpansionError> {
        self.expansions.fetch_add(1, Ordering::Relaxed);
        self.inner.expand(def, call)
    }
}

/// Fails with a non-cacheable [`ExpansionErrorKind::ToolUnavailable`] until
/// made available.
#[derive(Debug, Default)]
pub struct FlakyExpander {
    inner: TemplateExpander,
    available: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyExpander {
    /// Starts unavailable.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Calls to `expand`, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Expander for FlakyExpander {
    fn normalize_def(&self, body: &str) -> Option<MacroDefData> {
        self.inner.normalize_def(body)
    }

    fn normalize_call(&self, body: &str) -> Option<MacroCallData> {
        self.inner.normalize_call(body)
    }

    fn expand(&self, def: &MacroDefData, call: &MacroCallData) -> Result<Expansion, ExpansionError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if !self.available.load(Ordering::Acquire) {
            return Err(ExpansionError::new(
                ExpansionErrorKind::ToolUnavailable,
                "expansion server is starting",
            ));
        }
        self.inner.expand(def, call)
    }
}
