use std::ops::BitAnd;

/// Byte offset within a resource's linearized address space.
pub type Address = u64;

/// Half-open range `[begin, end)` over a resource address space.
///
/// A well-formed range is monotone (`begin <= end`); an empty range
/// (`begin == end`) is only meaningful as a query point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct AccessRange {
    pub begin: Address,
    pub end: Address,
}

impl AccessRange {
    pub const fn new(begin: Address, end: Address) -> Self {
        AccessRange { begin, end }
    }

    /// Range covering the entire address space of a resource.
    pub const fn whole() -> Self {
        AccessRange {
            begin: 0,
            end: Address::MAX,
        }
    }

    /// Range from an offset and a size.
    /// Returns `None` when the end would overflow.
    pub fn from_offset_size(offset: Address, size: Address) -> Option<Self> {
        let end = offset.checked_add(size)?;
        Some(AccessRange { begin: offset, end })
    }

    /// Range covered by `count` strided elements starting at `first_index`.
    pub fn from_indexed(offset: Address, first_index: u64, count: u64, stride: u64) -> Option<Self> {
        let begin = offset.checked_add(first_index.checked_mul(stride)?)?;
        let size = count.checked_mul(stride)?;
        Self::from_offset_size(begin, size)
    }

    pub const fn valid(&self) -> bool {
        self.begin <= self.end
    }

    pub const fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub const fn non_empty(&self) -> bool {
        self.begin < self.end
    }

    pub const fn distance(&self) -> Address {
        self.end - self.begin
    }

    pub const fn includes(&self, index: Address) -> bool {
        self.begin <= index && index < self.end
    }

    pub const fn intersects(&self, other: &AccessRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Entirely below `other`, with no overlap.
    pub const fn strictly_less(&self, other: &AccessRange) -> bool {
        self.end <= other.begin
    }

    /// Entirely above `other`, with no overlap.
    pub const fn strictly_greater(&self, other: &AccessRange) -> bool {
        other.end <= self.begin
    }

    pub const fn contains_range(&self, other: &AccessRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }
}

impl BitAnd for AccessRange {
    type Output = AccessRange;

    /// Intersection. Empty (possibly ill-formed) when the ranges are disjoint.
    fn bitand(self, rhs: AccessRange) -> AccessRange {
        AccessRange {
            begin: self.begin.max(rhs.begin),
            end: self.end.min(rhs.end),
        }
    }
}

/// Range over resource usage tags, reusing the address range representation.
pub type TagRange = AccessRange;
