//! Generations of the fixed-point expansion loop.

use std::fmt;

/// One pass of the expansion loop.
///
/// Output produced during step N is only visible to extraction starting at
/// step N+1, which keeps an expansion from feeding itself in the same pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct Step(u16);

impl Step {
    pub const ZERO: Step = Step(0);

    /// Default bound on the number of steps, matching rustc's default
    /// `recursion_limit`.
    pub const DEFAULT_LIMIT: u16 = 128;

    #[inline]
    pub const fn new(raw: u16) -> Self {
        Step(raw)
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// The following step. Saturates at `u16::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Step(self.0.saturating_add(1))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}", self.0)
    }
}
