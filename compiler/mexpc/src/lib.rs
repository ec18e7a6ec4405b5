//! Mexpc - Incremental Macro Expansion Engine
//!
//! Drives the fixed-point loop that expands every macro call in a project,
//! expands the calls found in those expansions, and so on, reusing every
//! recorded expansion whose inputs did not change.
//!
//! # Architecture
//!
//! ```text
//! ExpansionCoordinator::run
//!     │ per step
//!     ▼
//! StepRunner ──► host.units_for_step() ──► host.extract()   (parallel)
//!     │                                          │
//!     │                         pipeline::resolve_and_expand (parallel, read-only)
//!     │                                          │
//!     └──────── pipeline::materialize ──► ContentStore::apply ──► pipeline::commit
//!                                      (single writer)
//! ```
//!
//! The next step's units come from the blobs the previous step produced; the
//! loop ends when a step finds nothing to do or the recursion limit is hit.

pub mod commands;
pub mod config;
pub mod coordinator;
pub mod host;
pub mod pipeline;
pub mod progress;
pub mod step;
pub mod testing;
pub mod text_host;
pub mod tracing_setup;

pub use config::EngineConfig;
pub use coordinator::{
    EngineError, ExpansionCoordinator, FailureReason, RunOutcome, RunReport, RunState,
};
pub use host::{
    CallFlags, Capability, ExpansionHost, ExtractError, ExtractableUnit, ExtractedFile,
    FreshOutput, HostError, MacroCall, MacroDefinition, MacroKind, ResolveError,
};
pub use progress::{CancellationToken, NoProgress, ProgressSink};
pub use step::{StepReport, StepRunner};
pub use text_host::{TextProject, WarmUp};

pub use mexp_expand::{Expander, SharedExpansionCache, TemplateExpander};
pub use mexp_store::{IndexSnapshot, StorageError};
