//! Mexp Store - Expansion Output and the Expansion Index
//!
//! Two pieces of state survive between runs of the expansion engine:
//!
//! ```text
//! ContentStore                      ExpansionIndex
//! ┌──────────────────────┐          ┌───────────────────────────────┐
//! │ blob#0  step 0 bytes │◄─────────│ file#1:0  hashes  Ok(blob#0)  │
//! │ blob#1  step 1 bytes │◄─────────│ exp(blob#0):0  Ok(blob#1)     │
//! └──────────────────────┘          │ file#1:1  Err(CfgDisabled)    │
//!                                   └───────────────────────────────┘
//! ```
//!
//! The store holds the bytes; the index holds what produced them. The two must
//! agree: every `Ok` record names a live blob and every blob is named by one
//! record. A disagreement is [`StorageError::Corrupted`] and is never repaired
//! in place.
//!
//! Both are shared across worker threads through [`SharedStore`] and
//! [`SharedIndex`]: many readers during extraction, one writer at commit.

mod content;
mod error;
mod index;
mod record;
mod shared;
mod snapshot;

pub use content::{
    AppliedChangeset, ChangeOp, ChangeTicket, Changeset, ContentStore, DocumentView,
};
pub use error::StorageError;
pub use index::ExpansionIndex;
pub use record::{ExpandedOutput, ExpansionHashes, ExpansionOutcome, ExpansionRecord};
pub use shared::{SharedIndex, SharedStore};
pub use snapshot::{IndexSnapshot, SNAPSHOT_VERSION};
