//! Process-wide memo of expansion results, keyed by mix hash.
//!
//! # Lifecycle
//!
//! The cache is an explicit object: the host creates one, hands clones to
//! every engine that should share results, and calls
//! [`SharedExpansionCache::clear`] on shutdown or when a clean start is
//! forced. Clones share storage.
//!
//! # Concurrency
//!
//! Each key maps to a once-cell. The first worker to miss computes the value
//! while later workers asking for the same key wait on the cell, so one
//! (definition, call) pair is expanded at most once even when identical calls
//! land in the same parallel step. Published values never change.
//!
//! Failures flagged non-cacheable are handed to everyone waiting on that
//! computation and then dropped from the map, so the next request retries.

#![expect(
    clippy::disallowed_types,
    reason = "Arc is the implementation of SharedExpansionCache"
)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use mexp_ir::{ContentHash, ExpansionError};

use crate::{Expander, Expansion, MacroCallData, MacroDefData};

/// A memoized expansion result.
pub type CachedExpansion = Result<Arc<Expansion>, ExpansionError>;

type Cell = Arc<OnceLock<CachedExpansion>>;

#[derive(Default)]
struct CacheInner {
    entries: DashMap<ContentHash, Cell>,
    hits: AtomicU64,
    misses: AtomicU64,
    uncacheable: AtomicU64,
}

/// Counters describing cache effectiveness.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that ran the expander.
    pub misses: u64,
    /// Computed failures that were not memoized.
    pub uncacheable: u64,
    /// Published entries.
    pub entries: usize,
}

/// Shared memo table of expansion results.
#[derive(Clone, Default)]
pub struct SharedExpansionCache(Arc<CacheInner>);

impl SharedExpansionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized result for `mix_hash`, computing it on a miss.
    pub fn cached_expand(
        &self,
        expander: &dyn Expander,
        def: &MacroDefData,
        call: &MacroCallData,
        mix_hash: ContentHash,
    ) -> CachedExpansion {
        let cell: Cell = Arc::clone(self.0.entries.entry(mix_hash).or_default().value());

        let mut computed = false;
        let result = cell
            .get_or_init(|| {
                computed = true;
                expander.expand(def, call).map(Arc::new)
            })
            .clone();

        if computed {
            self.0.misses.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = &result {
                if !err.cacheable {
                    self.0.uncacheable.fetch_add(1, Ordering::Relaxed);
                    self.0
                        .entries
                        .remove_if(&mix_hash, |_, current| Arc::ptr_eq(current, &cell));
                    tracing::trace!(%mix_hash, error = %err, "not memoizing expansion failure");
                }
            }
        } else {
            self.0.hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Look up a result without computing anything.
    ///
    /// Used when an earlier pass (e.g. name resolution) may already have
    /// expanded the call.
    pub fn get_expansion_if_cached(&self, mix_hash: ContentHash) -> Option<CachedExpansion> {
        let cell: Cell = Arc::clone(self.0.entries.get(&mix_hash)?.value());
        let result = cell.get().cloned();
        if result.is_some() {
            self.0.hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        self.0
            .entries
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Counters keep accumulating.
    pub fn clear(&self) {
        self.0.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.0.hits.load(Ordering::Relaxed),
            misses: self.0.misses.load(Ordering::Relaxed),
            uncacheable: self.0.uncacheable.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl fmt::Debug for SharedExpansionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExpansionCache")
            .field("stats", &self.stats())
            .finish()
    }
}
