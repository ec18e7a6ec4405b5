//! Identities for source files, macro calls and expansion blobs.

use std::fmt;

/// Handle to one expansion blob in the content store.
///
/// Ids are never reused within a store, so a stale `BlobId` can be detected
/// by a failed lookup instead of silently aliasing new output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
#[repr(transparent)]
pub struct BlobId(u32);

impl BlobId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        BlobId(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob#{}", self.0)
    }
}

/// A unit of source text that may own macro calls.
///
/// Real files come from the host project; expansion files are the text of a
/// blob produced by an earlier step, scanned for further calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub enum FileId {
    Real(u32),
    Expansion(BlobId),
}

impl FileId {
    #[inline]
    pub const fn is_expansion(self) -> bool {
        matches!(self, FileId::Expansion(_))
    }

    /// The blob backing an expansion file.
    #[inline]
    pub const fn expansion_blob(self) -> Option<BlobId> {
        match self {
            FileId::Expansion(blob) => Some(blob),
            FileId::Real(_) => None,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileId::Real(raw) => write!(f, "file#{raw}"),
            FileId::Expansion(blob) => write!(f, "expansion({blob})"),
        }
    }
}

/// Identity of a macro call: the owning file and the call's slot in it.
///
/// Slots are assigned by the host in source order. The host keeps them stable
/// across edits as far as it can track the call; a slot the host no longer
/// reports is treated as a removed call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct CallId {
    pub file: FileId,
    pub slot: u32,
}

impl CallId {
    #[inline]
    pub const fn new(file: FileId, slot: u32) -> Self {
        CallId { file, slot }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.slot)
    }
}
