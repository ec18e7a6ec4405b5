//! The expander contract.

use mexp_ir::{combine_hashes, hash_str, ContentHash, ExpansionError, RangeMap};

/// A definition body in the form the expander consumes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacroDefData {
    pub text: String,
}

/// A call body in the form the expander consumes.
///
/// Offsets in an expansion's range map are relative to `text`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacroCallData {
    pub text: String,
}

/// Expansion text and its mapping back to the call body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expansion {
    pub text: String,
    pub ranges: RangeMap,
}

/// Turns a macro definition and a call into expansion text.
///
/// Implementations must be pure functions of their inputs: no ambient state,
/// no dependence on which thread runs them. Results are memoized by mix hash
/// and computed from any worker holding only read access.
pub trait Expander: Send + Sync {
    /// Normalize a definition body. `None` if it is unusable.
    fn normalize_def(&self, body: &str) -> Option<MacroDefData>;

    /// Normalize a call body. `None` if it is malformed.
    fn normalize_call(&self, body: &str) -> Option<MacroCallData>;

    /// Expand a call against a definition.
    fn expand(&self, def: &MacroDefData, call: &MacroCallData) -> Result<Expansion, ExpansionError>;
}

/// Identity of one expansion computation.
///
/// Two calls with the same normalized definition and call content share a mix
/// hash and therefore a cache entry.
pub fn mix_hash(def: &MacroDefData, call: &MacroCallData, call_body_hash: ContentHash) -> ContentHash {
    combine_hashes(&[hash_str(&def.text), hash_str(&call.text), call_body_hash])
}
