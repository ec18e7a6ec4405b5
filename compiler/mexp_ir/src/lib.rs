//! Mexp IR - Shared Expansion Vocabulary
//!
//! This crate contains the types every layer of the expansion engine agrees on:
//! - Content hashes for change detection and memoization keys
//! - Identities for source files, macro calls and output blobs
//! - Steps (generations) of the fixed-point loop
//! - Range maps from expansion text back to call-body text
//! - The per-call error taxonomy
//!
//! # Design Philosophy
//!
//! - **Small Copy ids**: `BlobId(u32)`, `FileId`, `CallId` are cheap to pass and hash
//! - **Content, not location**: hashes are computed over bytes, never over ids
//! - **Typed outcomes**: failures are values (`ExpansionPipelineError`), not panics
//!
//! Persisted types derive `serde` traits behind the `cache` feature.

/// Compile-time assertion that a type has a specific size.
///
/// Used to prevent accidental size regressions in frequently-copied id types.
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: [(); $size] = [(); ::std::mem::size_of::<$ty>()];
    };
}

mod error;
mod hash;
mod id;
mod range_map;
mod step;

pub use error::{ExpansionError, ExpansionErrorKind, ExpansionPipelineError, ResolveErrorKind};
pub use hash::{combine_hashes, hash_bytes, hash_str, ContentHash};
pub use id::{BlobId, CallId, FileId};
pub use range_map::{MappedRange, RangeMap};
pub use step::Step;

#[cfg(target_pointer_width = "64")]
mod size_asserts {
    use super::{BlobId, CallId, ContentHash, FileId, Step};

    static_assert_size!(BlobId, 4);
    static_assert_size!(FileId, 8);
    static_assert_size!(CallId, 12);
    static_assert_size!(ContentHash, 8);
    static_assert_size!(Step, 2);
}
