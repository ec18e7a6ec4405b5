//! Engine configuration.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use mexp_ir::Step;

/// Configuration for an [`ExpansionCoordinator`](crate::ExpansionCoordinator).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Highest step a run may reach. Output of that step is not scanned
    /// further.
    pub recursion_limit: u16,
    /// Number of worker threads (0 = auto-detect).
    pub jobs: usize,
    /// Run Stage 1 on the worker pool.
    pub parallel: bool,
    /// Units per parallel chunk.
    pub chunk_size: usize,
    /// Extra attempts after the host denies read access to a unit.
    pub read_retries: u32,
    /// Calls written in one step that switch the host into heavy mode.
    pub heavy_threshold: usize,
    /// Interval at which the coordinator reports progress and polls for
    /// cancellation while a step runs.
    pub tick: Duration,
    /// Check index/store agreement before the first step.
    pub verify_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            recursion_limit: Step::DEFAULT_LIMIT,
            jobs: 0,
            parallel: true,
            chunk_size: 16,
            read_retries: 3,
            heavy_threshold: 256,
            tick: Duration::from_millis(50),
            verify_on_start: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `MEXP_RECURSION_LIMIT`, `MEXP_JOBS` and
    /// `MEXP_CHUNK_SIZE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(limit) = env_override("MEXP_RECURSION_LIMIT") {
            config.recursion_limit = limit;
        }
        if let Some(jobs) = env_override("MEXP_JOBS") {
            config.jobs = jobs;
        }
        if let Some(chunk) = env_override("MEXP_CHUNK_SIZE") {
            config.chunk_size = chunk;
        }
        config
    }

    #[must_use]
    pub fn with_recursion_limit(mut self, limit: u16) -> Self {
        self.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    #[must_use]
    pub fn with_heavy_threshold(mut self, threshold: usize) -> Self {
        self.heavy_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    #[must_use]
    pub fn with_verify_on_start(mut self, verify: bool) -> Self {
        self.verify_on_start = verify;
        self
    }

    /// Get the effective number of jobs.
    pub fn effective_jobs(&self) -> usize {
        if self.jobs == 0 {
            thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1)
        } else {
            self.jobs
        }
    }

    /// Chunk size, never zero.
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    /// The last step a run executes.
    pub fn limit(&self) -> Step {
        Step::new(self.recursion_limit.min(u16::MAX - 1))
    }
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limit(), Step::new(Step::DEFAULT_LIMIT));
        assert!(config.parallel);
        assert!(config.verify_on_start);
    }

    #[test]
    fn builders_chain() {
        let config = EngineConfig::default()
            .with_recursion_limit(4)
            .with_jobs(2)
            .with_parallel(false)
            .with_chunk_size(0);
        assert_eq!(config.limit(), Step::new(4));
        assert_eq!(config.effective_jobs(), 2);
        assert!(!config.parallel);
        assert_eq!(config.effective_chunk_size(), 1);
    }

    #[test]
    fn auto_jobs_is_positive() {
        assert!(EngineConfig::default().effective_jobs() >= 1);
    }
}
