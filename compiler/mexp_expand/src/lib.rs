//! Mexp Expand - Expanders and the Shared Expansion Cache
//!
//! An [`Expander`] turns a normalized macro definition and a normalized call
//! into expansion text plus a [`RangeMap`](mexp_ir::RangeMap). Expanders are
//! pure: the result depends only on the two inputs, which is what makes the
//! [`SharedExpansionCache`] keyed by mix hash sound.
//!
//! ```text
//! (def body, call body) ──normalize──► (MacroDefData, MacroCallData)
//!                                            │ mix hash
//!                                            ▼
//!                         SharedExpansionCache ──miss──► Expander::expand
//! ```

mod cache;
mod expander;
mod template;

pub use cache::{CacheStats, CachedExpansion, SharedExpansionCache};
pub use expander::{mix_hash, Expander, Expansion, MacroCallData, MacroDefData};
pub use template::{MAX_ARGS, TemplateExpander};
