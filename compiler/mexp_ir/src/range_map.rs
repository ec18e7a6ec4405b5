//! Mapping from expansion text back to the call body it came from.
//!
//! Each [`MappedRange`] says that `len` bytes starting at `dst_offset` in the
//! expansion output were copied verbatim from `src_offset` in the call body.
//! Text introduced by the macro definition itself has no mapping.
//!
//! # Invariants
//!
//! - Ranges are sorted by `dst_offset` and never overlap in the destination.
//! - Adjacent ranges that are contiguous in both source and destination are
//!   merged, so equal mappings have equal representations.

/// A contiguous run of bytes copied from the call body into the expansion.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct MappedRange {
    /// Start offset in the call body.
    pub src_offset: u32,
    /// Start offset in the expansion text.
    pub dst_offset: u32,
    /// Length in bytes.
    pub len: u32,
}

impl MappedRange {
    #[inline]
    pub const fn new(src_offset: u32, dst_offset: u32, len: u32) -> Self {
        MappedRange {
            src_offset,
            dst_offset,
            len,
        }
    }

    #[inline]
    pub const fn dst_end(&self) -> u32 {
        self.dst_offset + self.len
    }

    #[inline]
    pub const fn src_end(&self) -> u32 {
        self.src_offset + self.len
    }

    /// Whether `next` continues this range in both source and destination.
    #[inline]
    fn continues_into(&self, next: &MappedRange) -> bool {
        self.src_end() == next.src_offset && self.dst_end() == next.dst_offset
    }
}

/// Sorted, merged set of [`MappedRange`]s for one expansion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cache", derive(serde::Serialize, serde::Deserialize))]
pub struct RangeMap {
    ranges: Vec<MappedRange>,
}

impl RangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from unordered ranges.
    ///
    /// Empty ranges are dropped. Ranges overlapping an earlier range in the
    /// destination are dropped too, since a destination byte has one origin.
    pub fn from_ranges(mut ranges: Vec<MappedRange>) -> Self {
        ranges.retain(|r| r.len > 0);
        ranges.sort_by_key(|r| (r.dst_offset, r.src_offset));

        let mut map = RangeMap {
            ranges: Vec::with_capacity(ranges.len()),
        };
        for range in ranges {
            map.push(range);
        }
        map
    }

    /// Append a range that starts at or after the end of the last one.
    ///
    /// Out-of-order or overlapping ranges are ignored.
    pub fn push(&mut self, range: MappedRange) {
        if range.len == 0 {
            return;
        }
        match self.ranges.last_mut() {
            Some(last) if range.dst_offset < last.dst_end() => {}
            Some(last) if last.continues_into(&range) => last.len += range.len,
            _ => self.ranges.push(range),
        }
    }

    pub fn ranges(&self) -> &[MappedRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Map an offset in the expansion to the call-body offset it came from.
    pub fn map_to_source(&self, dst: u32) -> Option<u32> {
        let idx = self.ranges.partition_point(|r| r.dst_end() <= dst);
        let range = self.ranges.get(idx)?;
        (range.dst_offset <= dst).then(|| range.src_offset + (dst - range.dst_offset))
    }

    /// Map a call-body offset to every expansion offset it was copied to.
    ///
    /// A macro may repeat an argument, so one source byte can appear several
    /// times in the output.
    pub fn map_from_source(&self, src: u32) -> Vec<u32> {
        self.ranges
            .iter()
            .filter(|r| r.src_offset <= src && src < r.src_end())
            .map(|r| r.dst_offset + (src - r.src_offset))
            .collect()
    }
}
