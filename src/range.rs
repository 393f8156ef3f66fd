//! Half-open address ranges
//!
//! A [`Range`] is the unit every land deals in: the span `[base, limit)` of
//! the address domain. Ranges are ordered by base so they sort the way the
//! lands store them.

use std::cmp::Ordering;
use std::fmt;

/// An address in the managed address space
pub type Addr = usize;

/// Round `addr` up to a multiple of `align` (which must be a power of two)
#[inline]
pub fn align_up(addr: Addr, align: usize) -> Addr {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Round `addr` down to a multiple of `align` (which must be a power of two)
#[inline]
pub fn align_down(addr: Addr, align: usize) -> Addr {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Whether `addr` is a multiple of `align`
#[inline]
pub fn is_aligned(addr: Addr, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    addr & (align - 1) == 0
}

/// The half-open span `[base, limit)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Range {
    base: Addr,
    limit: Addr,
}

impl Range {
    /// Create the range `[base, limit)`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `base > limit`.
    #[inline]
    pub fn new(base: Addr, limit: Addr) -> Self {
        debug_assert!(base <= limit, "range base {base:#x} above limit {limit:#x}");
        Self { base, limit }
    }

    /// Create the range of `size` bytes starting at `base`
    #[inline]
    pub fn with_size(base: Addr, size: usize) -> Self {
        Self::new(base, base + size)
    }

    /// The empty range at address zero
    #[inline]
    pub const fn empty() -> Self {
        Self { base: 0, limit: 0 }
    }

    /// The lowest address in the range
    #[inline]
    pub fn base(&self) -> Addr {
        self.base
    }

    /// The first address past the range
    #[inline]
    pub fn limit(&self) -> Addr {
        self.limit
    }

    /// Bytes in the range
    #[inline]
    pub fn size(&self) -> usize {
        self.limit - self.base
    }

    /// Whether the range holds no addresses
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.base == self.limit
    }

    /// Whether `inner` lies entirely within `self`
    #[inline]
    pub fn nests(&self, inner: &Range) -> bool {
        self.base <= inner.base && inner.limit <= self.limit
    }

    /// Whether the two ranges share at least one address
    #[inline]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.base < other.limit && other.base < self.limit
    }

    /// Whether both bounds are multiples of `align`
    #[inline]
    pub fn is_aligned(&self, align: usize) -> bool {
        is_aligned(self.base, align) && is_aligned(self.limit, align)
    }

    /// The part of `self` below `inner`, which may be empty
    #[inline]
    pub fn left_of(&self, inner: &Range) -> Range {
        Range::new(self.base, inner.base.max(self.base))
    }

    /// The part of `self` above `inner`, which may be empty
    #[inline]
    pub fn right_of(&self, inner: &Range) -> Range {
        Range::new(inner.limit.min(self.limit), self.limit)
    }
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base
            .cmp(&other.base)
            .then_with(|| self.limit.cmp(&other.limit))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.limit)
    }
}

impl From<std::ops::Range<Addr>> for Range {
    fn from(r: std::ops::Range<Addr>) -> Self {
        Range::new(r.start, r.end)
    }
}
