//! The interface between the engine and the project that owns the sources.
//!
//! The engine never parses source text or resolves names itself. A host
//! tells it which files to look at in each step, extracts their macro calls,
//! and resolves each call to a definition. Everything else (hashing,
//! expansion, storage, the fixed-point loop) is the engine's job.

use std::fmt;

use bitflags::bitflags;
use mexp_ir::{hash_str, BlobId, CallId, ContentHash, FileId, ResolveErrorKind, Step};
use mexp_store::ContentStore;

bitflags! {
    /// Per-call state reported by the host at extraction time.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct CallFlags: u8 {
        /// The call's enclosing syntax is intact.
        const VALID = 1 << 0;
        /// Conditional compilation leaves the call active.
        const CFG_ENABLED = 1 << 1;
    }
}

impl Default for CallFlags {
    fn default() -> Self {
        CallFlags::VALID | CallFlags::CFG_ENABLED
    }
}

/// One macro invocation site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacroCall {
    pub id: CallId,
    /// Path naming the invoked macro.
    pub path: String,
    /// Argument text between the call's delimiters.
    pub body: String,
    pub body_hash: ContentHash,
    pub flags: CallFlags,
}

impl MacroCall {
    pub fn new(id: CallId, path: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        MacroCall {
            id,
            path: path.into(),
            body_hash: hash_str(&body),
            body,
            flags: CallFlags::default(),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: CallFlags) -> Self {
        self.flags = flags;
        self
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(CallFlags::VALID)
    }

    #[inline]
    pub fn is_cfg_enabled(&self) -> bool {
        self.flags.contains(CallFlags::CFG_ENABLED)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MacroKind {
    /// Template-style macro expanded in process.
    Declarative,
    /// Macro backed by external tooling that may be switched off.
    Procedural,
}

/// The resolved target of a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacroDefinition {
    pub kind: MacroKind,
    pub body: String,
    pub body_hash: ContentHash,
}

impl MacroDefinition {
    pub fn new(kind: MacroKind, body: impl Into<String>) -> Self {
        let body = body.into();
        MacroDefinition {
            kind,
            body_hash: hash_str(&body),
            body,
        }
    }
}

/// Why a call could not be resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResolveError {
    pub kind: ResolveErrorKind,
    /// The condition may clear without any source change (e.g. the project
    /// model is still loading), so the failure must not be memoized.
    pub transient: bool,
}

impl ResolveError {
    pub const fn new(kind: ResolveErrorKind) -> Self {
        ResolveError {
            kind,
            transient: false,
        }
    }

    #[must_use]
    pub const fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Availability of expansion for a call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Capability {
    #[default]
    Enabled,
    /// The capability exists but is switched off.
    Off,
    /// The capability does not exist for this call at all.
    Absent,
}

/// A file and the calls in it selected for one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractableUnit {
    pub file: FileId,
    /// Selected call slots; `None` selects every call in the file.
    pub slots: Option<Vec<u32>>,
    /// Slots another unit of the same step already covers.
    pub excluded: Vec<u32>,
    /// Step the unit was first scheduled in. Never changes while the unit is
    /// pending.
    pub origin: Step,
}

impl ExtractableUnit {
    /// A unit covering every call in `file`.
    pub fn whole_file(file: FileId, origin: Step) -> Self {
        ExtractableUnit {
            file,
            slots: None,
            excluded: Vec::new(),
            origin,
        }
    }

    pub fn slots(file: FileId, slots: Vec<u32>, origin: Step) -> Self {
        ExtractableUnit {
            file,
            slots: Some(slots),
            excluded: Vec::new(),
            origin,
        }
    }

    /// The same unit minus `slots`.
    #[must_use]
    pub fn without(mut self, slots: &[u32]) -> Self {
        for &slot in slots {
            if !self.excluded.contains(&slot) {
                self.excluded.push(slot);
            }
        }
        self
    }

    /// Whether the unit selects `slot`.
    pub fn selects(&self, slot: u32) -> bool {
        !self.excluded.contains(&slot)
            && self.slots.as_ref().map_or(true, |slots| slots.contains(&slot))
    }

    /// Whether the unit selects any slot at all.
    pub fn selects_any(&self) -> bool {
        self.slots
            .as_ref()
            .map_or(true, |slots| slots.iter().any(|slot| !self.excluded.contains(slot)))
    }
}

/// The calls found in one file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedFile {
    pub calls: Vec<MacroCall>,
}

/// Why a unit could not be extracted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtractError {
    /// The file's syntax is not available yet; retry in the next step.
    NotReady,
    /// The read gate was denied; retry shortly.
    ReadDenied,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::NotReady => write!(f, "syntax not ready"),
            ExtractError::ReadDenied => write!(f, "read access denied"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Failure of a best-effort host pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError {
            message: message.into(),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HostError {}

/// A call that holds a live blob after a step.
///
/// The blob's text is a candidate file for the next step.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FreshOutput {
    pub call: CallId,
    pub blob: BlobId,
    pub step: Step,
}

/// The project the engine expands macros for.
///
/// Called from worker threads while the engine holds read access to the
/// content store; implementations must not block on the engine.
pub trait ExpansionHost: Send + Sync {
    /// Units to process in `step`.
    ///
    /// `fresh` lists the blobs produced by the previous step; a host normally
    /// returns one [`FileId::Expansion`] unit per fresh blob it wants scanned.
    fn units_for_step(&self, step: Step, fresh: &[FreshOutput]) -> Vec<ExtractableUnit>;

    /// Extract the calls of a unit's file. `expansions` holds the text of
    /// expansion files.
    fn extract(
        &self,
        unit: &ExtractableUnit,
        expansions: &ContentStore,
    ) -> Result<ExtractedFile, ExtractError>;

    fn resolve(&self, call: &MacroCall) -> Result<MacroDefinition, ResolveError>;

    fn capability(&self, _call: &MacroCall) -> Capability {
        Capability::Enabled
    }

    /// Whether the host's model is consistent enough to extract from.
    fn is_consistent(&self) -> bool {
        true
    }

    /// Opportunistic pass run before the first step. Failures are logged and
    /// otherwise ignored.
    fn warm_up(&self) -> Result<(), HostError> {
        Ok(())
    }

    /// Notification that the run is producing enough output to justify
    /// heavier processing (`true`), or that the run is over (`false`).
    fn heavy_mode(&self, _enabled: bool) {}
}
