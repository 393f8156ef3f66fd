//! Zone sets
//!
//! The address space is striped into [`ZONE_COUNT`] zones: an address belongs
//! to zone `(addr >> zone_shift) % ZONE_COUNT`, so every stripe of
//! `1 << zone_shift` bytes is in exactly one zone and the pattern repeats every
//! `ZONE_COUNT` stripes. A [`ZoneSet`] names a subset of the zones and is used
//! to restrict where a land may find free space.

use bitvec::prelude::*;
use std::fmt;

use crate::range::{align_down, Addr, Range};

/// Number of zones the address space is striped into
pub const ZONE_COUNT: usize = 64;

/// Number of stripes a fit search has to walk before the zone pattern has
/// repeated often enough that no later run can be longer than one already seen
const FIT_STRIPE_WINDOW: usize = 2 * ZONE_COUNT + 1;

/// A set of zones over an address space with a fixed stripe width
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ZoneSet {
    bits: BitArray<[u64; 1], Lsb0>,
    shift: u32,
}

impl ZoneSet {
    /// The set containing no zones
    pub fn empty(shift: u32) -> Self {
        Self {
            bits: BitArray::ZERO,
            shift,
        }
    }

    /// The set containing every zone
    pub fn universal(shift: u32) -> Self {
        Self {
            bits: BitArray::new([u64::MAX]),
            shift,
        }
    }

    /// The set containing only `zone`
    pub fn single(shift: u32, zone: usize) -> Self {
        Self::empty(shift).with_zone(zone)
    }

    /// The set of zones touched by `range`
    pub fn of_range(shift: u32, range: Range) -> Self {
        let mut set = Self::empty(shift);
        if range.is_empty() {
            return set;
        }
        let stripes = (range.limit() - 1 - align_down(range.base(), 1 << shift)) >> shift;
        if stripes >= ZONE_COUNT {
            return Self::universal(shift);
        }
        let first = set.zone_of(range.base());
        for i in 0..=stripes {
            set.bits.set((first + i) % ZONE_COUNT, true);
        }
        set
    }

    /// Add `zone` to the set
    pub fn with_zone(mut self, zone: usize) -> Self {
        self.bits.set(zone % ZONE_COUNT, true);
        self
    }

    /// Width of one stripe in bytes
    #[inline]
    pub fn stripe(&self) -> usize {
        1 << self.shift
    }

    /// Log2 of the stripe width
    #[inline]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// The zone containing `addr`
    #[inline]
    pub fn zone_of(&self, addr: Addr) -> usize {
        (addr >> self.shift) % ZONE_COUNT
    }

    /// Whether `zone` is in the set
    #[inline]
    pub fn contains_zone(&self, zone: usize) -> bool {
        self.bits[zone % ZONE_COUNT]
    }

    /// Whether the zone containing `addr` is in the set
    #[inline]
    pub fn contains_addr(&self, addr: Addr) -> bool {
        self.contains_zone(self.zone_of(addr))
    }

    /// Whether the set has no zones
    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Whether the set has every zone
    pub fn is_universal(&self) -> bool {
        self.bits.all()
    }

    /// Number of zones in the set
    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    /// Zones in either set. Both sets must share a stripe width.
    pub fn union(&self, other: &ZoneSet) -> ZoneSet {
        debug_assert_eq!(self.shift, other.shift);
        Self {
            bits: BitArray::new([self.bits.data[0] | other.bits.data[0]]),
            shift: self.shift,
        }
    }

    /// Zones in both sets. Both sets must share a stripe width.
    pub fn intersection(&self, other: &ZoneSet) -> ZoneSet {
        debug_assert_eq!(self.shift, other.shift);
        Self {
            bits: BitArray::new([self.bits.data[0] & other.bits.data[0]]),
            shift: self.shift,
        }
    }

    /// Find a `size`-byte subrange of `range` lying wholly in the set's zones.
    ///
    /// With `high` the highest such subrange is returned, otherwise the
    /// lowest. The result is aligned whenever `range`, `size` and the stripe
    /// width all are.
    pub fn fit(&self, range: Range, size: usize, high: bool) -> Option<Range> {
        if size == 0 || range.size() < size || self.is_empty() {
            return None;
        }
        if self.is_universal() {
            return Some(if high {
                Range::new(range.limit() - size, range.limit())
            } else {
                Range::with_size(range.base(), size)
            });
        }
        if high {
            self.fit_high(range, size)
        } else {
            self.fit_low(range, size)
        }
    }

    fn fit_low(&self, range: Range, size: usize) -> Option<Range> {
        let stripe = self.stripe();
        let mut run_base: Option<Addr> = None;
        let mut addr = range.base();
        let mut walked = 0;
        while addr < range.limit() && walked < FIT_STRIPE_WINDOW {
            let next = align_down(addr, stripe)
                .checked_add(stripe)
                .map_or(range.limit(), |n| n.min(range.limit()));
            if self.contains_addr(addr) {
                let base = *run_base.get_or_insert(addr);
                if next - base >= size {
                    return Some(Range::with_size(base, size));
                }
            } else {
                run_base = None;
            }
            addr = next;
            walked += 1;
        }
        None
    }

    fn fit_high(&self, range: Range, size: usize) -> Option<Range> {
        let stripe = self.stripe();
        let mut run_limit: Option<Addr> = None;
        let mut addr = range.limit();
        let mut walked = 0;
        while addr > range.base() && walked < FIT_STRIPE_WINDOW {
            let prev = align_down(addr - 1, stripe).max(range.base());
            if self.contains_addr(addr - 1) {
                let limit = *run_limit.get_or_insert(addr);
                if limit - prev >= size {
                    return Some(Range::new(limit - size, limit));
                }
            } else {
                run_limit = None;
            }
            addr = prev;
            walked += 1;
        }
        None
    }
}

impl fmt::Debug for ZoneSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ZoneSet({:#018x}, shift={})", self.bits.data[0], self.shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: u32 = 12;

    #[test]
    fn test_zone_membership() {
        let set = ZoneSet::single(SHIFT, 3);
        assert!(set.contains_addr(3 << SHIFT));
        assert!(set.contains_addr((3 << SHIFT) + 4095));
        assert!(!set.contains_addr(4 << SHIFT));
        // The pattern repeats every ZONE_COUNT stripes.
        assert!(set.contains_addr((3 + ZONE_COUNT) << SHIFT));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_union_and_intersection() {
        let a = ZoneSet::single(SHIFT, 1).with_zone(2);
        let b = ZoneSet::single(SHIFT, 2).with_zone(5);
        assert_eq!(a.union(&b).len(), 3);
        assert_eq!(a.intersection(&b), ZoneSet::single(SHIFT, 2));
        assert!(ZoneSet::empty(SHIFT).is_empty());
        assert!(ZoneSet::universal(SHIFT).is_universal());
    }

    #[test]
    fn test_of_range() {
        let set = ZoneSet::of_range(SHIFT, Range::new(1 << SHIFT, 3 << SHIFT));
        assert!(set.contains_zone(1));
        assert!(set.contains_zone(2));
        assert!(!set.contains_zone(3));

        let huge = Range::new(0, (ZONE_COUNT + 1) << SHIFT);
        assert!(ZoneSet::of_range(SHIFT, huge).is_universal());
    }

    #[test]
    fn test_fit_low_and_high() {
        let set = ZoneSet::single(SHIFT, 2).with_zone(3).with_zone(6);
        let range = Range::new(0, 8 << SHIFT);

        let low = set.fit(range, 4096, false).unwrap();
        assert_eq!(low, Range::with_size(2 << SHIFT, 4096));

        let high = set.fit(range, 4096, true).unwrap();
        assert_eq!(high, Range::with_size(6 << SHIFT, 4096));

        // Only zones 2 and 3 are contiguous.
        let two = set.fit(range, 8192, true).unwrap();
        assert_eq!(two, Range::new(2 << SHIFT, 4 << SHIFT));
        assert!(set.fit(range, 3 * 4096, false).is_none());
    }

    #[test]
    fn test_fit_partial_stripes() {
        let set = ZoneSet::single(SHIFT, 1);
        let range = Range::new((1 << SHIFT) + 1024, 2 << SHIFT);
        assert_eq!(set.fit(range, 1024, false), Some(Range::with_size(range.base(), 1024)));
        assert_eq!(set.fit(range, 1024, true), Some(Range::new((2 << SHIFT) - 1024, 2 << SHIFT)));
        assert!(set.fit(range, 4096, false).is_none());
    }

    #[test]
    fn test_fit_far_from_range_base() {
        let set = ZoneSet::single(SHIFT, 63);
        let range = Range::new(0, 1 << 30);
        assert_eq!(set.fit(range, 4096, false), Some(Range::with_size(63 << SHIFT, 4096)));
        assert!(set.fit(range, 8192, false).is_none());
    }
}
