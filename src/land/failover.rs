//! Failover land
//!
//! A failover combines a *primary* land, which coalesces and searches well
//! but may fail to grow its bookkeeping, with a *secondary* land that never
//! fails to grow. It presents the ordinary [`Land`] contract and keeps two
//! promises even while the primary is out of nodes:
//!
//! - no range that was inserted and not deleted is ever lost;
//! - no range is ever held twice.
//!
//! Before most operations the secondary is flushed into the primary so that
//! the primary gets every chance to coalesce and to answer searches. Inserts
//! that fail for lack of bookkeeping go to the secondary. A delete that needs
//! the primary to split a block it cannot split removes the whole block and
//! reinserts the two remainders, in the secondary if need be.
//!
//! The failover borrows both sub-lands; their owner keeps them alive and
//! gets them back, with whatever ranges they hold, when the failover is
//! dropped. Every operation takes `&mut self` and the repair path only ever
//! calls the sub-lands, so a failover cannot be re-entered.

use std::fmt;

use bumpalo::Bump;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::range::Range;
use crate::zone::ZoneSet;

use super::{FindDelete, Found, Land, LandError, LandResult, Visit};

/// Land that falls back from a primary to a secondary land
pub struct Failover<'a> {
    primary: &'a mut dyn Land,
    secondary: &'a mut dyn Land,
    alignment: usize,
}

impl<'a> Failover<'a> {
    /// Create a failover over `primary` and `secondary`.
    ///
    /// Both sub-lands must use `alignment`. In debug builds both must also
    /// pass their structural self-check.
    pub fn new(
        primary: &'a mut dyn Land,
        secondary: &'a mut dyn Land,
        alignment: usize,
    ) -> LandResult<Self> {
        debug_assert!(alignment.is_power_of_two());
        if primary.alignment() != alignment || secondary.alignment() != alignment {
            return Err(LandError::inconsistent(
                "failover sub-lands do not share its alignment",
            ));
        }
        if cfg!(debug_assertions) {
            primary.check()?;
            secondary.check()?;
        }
        Ok(Self {
            primary,
            secondary,
            alignment,
        })
    }

    /// Create a failover whose control block lives in `arena`.
    pub fn new_in(
        arena: &'a Bump,
        primary: &'a mut dyn Land,
        secondary: &'a mut dyn Land,
        alignment: usize,
    ) -> LandResult<&'a mut Failover<'a>> {
        Ok(arena.alloc(Self::new(primary, secondary, alignment)?))
    }

    /// The land tried first
    pub fn primary(&self) -> &dyn Land {
        &*self.primary
    }

    /// The land that takes what the primary cannot
    pub fn secondary(&self) -> &dyn Land {
        &*self.secondary
    }

    /// Give the primary as many of the secondary's ranges as it will take.
    fn flush(&mut self) {
        if self.secondary.size() == 0 {
            return;
        }
        if !super::flush(&mut *self.primary, &mut *self.secondary) {
            trace!(
                remaining = self.secondary.size(),
                "primary refused part of the secondary"
            );
        }
    }

    fn check_range(&self, range: &Range) {
        debug_assert!(!range.is_empty(), "empty range {range}");
        debug_assert!(range.is_aligned(self.alignment), "misaligned range {range}");
    }

    /// Delete `range` from the primary by removing the whole of `old`, the
    /// block the primary could not split, and reinserting what is left.
    fn delete_by_repair(&mut self, range: Range, old: Range) -> LandResult<Range> {
        debug_assert!(old.nests(&range));
        warn!(%range, %old, "primary cannot split block, reinserting remainders");

        // Removing a whole block needs no new node.
        let removed = self.primary.delete(old)?;
        debug_assert_eq!(removed, old);

        let fragments: SmallVec<[Range; 2]> = [old.left_of(&range), old.right_of(&range)]
            .into_iter()
            .filter(|fragment| !fragment.is_empty())
            .collect();
        for fragment in fragments {
            self.reinsert(fragment);
        }
        Ok(old)
    }

    /// Put a delete remainder back, in the secondary if the primary refuses.
    fn reinsert(&mut self, fragment: Range) {
        let Err(err) = self.primary.insert(fragment) else {
            return;
        };
        // The fragment was part of a block the primary held a moment ago.
        debug_assert!(!err.is_not_applicable(), "fragment {fragment} overlaps the primary");
        debug!(%fragment, %err, "primary refused remainder, moving it to the secondary");
        if let Err(err) = self.secondary.insert(fragment) {
            panic!("secondary land refused remainder {fragment}: {err}");
        }
    }
}

impl Land for Failover<'_> {
    fn kind(&self) -> &'static str {
        "failover"
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn size(&self) -> usize {
        self.primary.size() + self.secondary.size()
    }

    fn insert(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);
        self.flush();

        match self.primary.insert(range) {
            Err(err) if err.is_resource_failure() => {
                debug!(%range, %err, "primary cannot grow, inserting into the secondary");
                self.secondary.insert(range)
            }
            other => other,
        }
    }

    fn insert_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.check_range(range);
        self.flush();

        // No fallback: stealing is how the primary avoids needing to grow.
        let result = self.primary.insert_steal(range);
        if let Err(err) = &result {
            trace!(%range, %err, "primary steal insert failed");
        }
        result
    }

    fn delete(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);
        self.flush();

        match self.primary.delete(range) {
            Ok(old) => {
                debug_assert!(old.nests(&range));
                Ok(old)
            }
            Err(LandError::NotApplicable { .. }) => {
                trace!(%range, "range not in the primary, deleting from the secondary");
                self.secondary.delete(range)
            }
            Err(LandError::ResourceFailure {
                containing: Some(old),
                ..
            }) => self.delete_by_repair(range, old),
            Err(err) => {
                debug_assert!(false, "primary delete failed without a containing block: {err}");
                Err(err)
            }
        }
    }

    fn delete_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.check_range(range);
        self.flush();

        let result = match self.primary.delete_steal(range) {
            Err(LandError::NotApplicable { .. }) => self.secondary.delete_steal(range),
            other => other,
        };
        debug_assert!(
            !result.as_ref().is_err_and(LandError::is_resource_failure),
            "steal delete ran out of bookkeeping"
        );
        result
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool {
        self.primary.iterate(&mut *visitor) && self.secondary.iterate(&mut *visitor)
    }

    fn iterate_and_delete(&mut self, visitor: &mut dyn FnMut(Range) -> Visit) -> bool {
        self.primary.iterate_and_delete(&mut *visitor)
            && self.secondary.iterate_and_delete(&mut *visitor)
    }

    fn find_first(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        self.flush();
        self.primary
            .find_first(size, find_delete)
            .or_else(|| self.secondary.find_first(size, find_delete))
    }

    fn find_last(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        self.flush();
        self.primary
            .find_last(size, find_delete)
            .or_else(|| self.secondary.find_last(size, find_delete))
    }

    fn find_largest(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        self.flush();
        self.primary
            .find_largest(size, find_delete)
            .or_else(|| self.secondary.find_largest(size, find_delete))
    }

    fn find_in_zones(
        &mut self,
        size: usize,
        zones: &ZoneSet,
        high: bool,
    ) -> LandResult<Option<Found>> {
        self.flush();

        match self.primary.find_in_zones(size, zones, high) {
            Ok(Some(found)) => Ok(Some(found)),
            Ok(None) => self.secondary.find_in_zones(size, zones, high),
            // The primary found a fit but could not split its block; carve
            // it out the way a delete would.
            Err(LandError::ResourceFailure {
                range,
                containing: Some(old),
            }) => {
                debug!(%range, %old, "primary cannot carve a zoned range, repairing");
                let old_range = self.delete_by_repair(range, old)?;
                Ok(Some(Found { range, old_range }))
            }
            Err(err) => {
                debug!(size, %err, "primary zoned search failed, searching the secondary");
                self.secondary.find_in_zones(size, zones, high)
            }
        }
    }

    fn check(&self) -> LandResult<()> {
        if self.primary.alignment() != self.alignment || self.secondary.alignment() != self.alignment {
            return Err(LandError::inconsistent(
                "failover sub-lands do not share its alignment",
            ));
        }
        self.primary.check()?;
        self.secondary.check()?;

        // Nothing may be held by both sub-lands.
        let mut held = super::ranges(self);
        held.sort();
        let mut reach: Option<usize> = None;
        for range in held {
            if reach.is_some_and(|limit| range.base() < limit) {
                return Err(LandError::inconsistent("failover sub-lands hold overlapping ranges"));
            }
            reach = Some(reach.map_or(range.limit(), |limit| limit.max(range.limit())));
        }
        Ok(())
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> fmt::Result {
        writeln!(
            out,
            "{:depth$}failover {{ size: {:#x}, alignment: {:#x} }}",
            "",
            self.size(),
            self.alignment,
        )?;
        writeln!(out, "{:width$}primary = {}", "", self.primary.kind(), width = depth + 2)?;
        self.primary.describe(out, depth + 4)?;
        writeln!(out, "{:width$}secondary = {}", "", self.secondary.kind(), width = depth + 2)?;
        self.secondary.describe(out, depth + 4)
    }
}

impl fmt::Debug for Failover<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failover")
            .field("primary", &self.primary.kind())
            .field("secondary", &self.secondary.kind())
            .field("alignment", &self.alignment)
            .field("size", &self.size())
            .finish()
    }
}
