//! The three-stage protocol every selected macro call goes through.
//!
//! ```text
//!              read index + store          changeset             index write lock
//! MacroCall ──► Stage 1: resolve ──► Stage1Result ──► Stage 2 ──► Stage2Result ──► Stage 3 ──► CommitOutcome
//!               & expand                             materialize                   commit
//! ```
//!
//! Each stage consumes the previous stage's result by value. Stage 1 runs in
//! parallel across a step; Stage 2 appends to the step's single [`Changeset`];
//! Stage 3 runs after that changeset has been applied.
//!
//! A [`Stage1Result::NoOp`] passes through Stage 2 and Stage 3 without
//! touching the store or the index.
//!
//! [`Changeset`]: mexp_store::Changeset

mod stage1;
mod stage2;
mod stage3;

pub use stage1::{invalidate_removed, resolve_and_expand, Stage1Context, Stage1Result};
pub use stage2::{materialize, BlobTarget, Stage2Result};
pub use stage3::{commit, CommitOutcome};

#[cfg(test)]
mod tests;
