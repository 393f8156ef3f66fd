//! Lands: sets of free address ranges
//!
//! A land is a mutable set of pairwise disjoint, aligned ranges. Pools keep
//! their free space in one and allocate by finding and deleting ranges from
//! it. The [`Land`] trait is the contract every implementation provides; the
//! implementations here are:
//!
//! - [`Cbs`], a coalescing block structure that needs a bookkeeping node per
//!   block and can run out of them
//! - [`Freelist`], which keeps its bookkeeping inside the free blocks and so
//!   never fails to grow
//! - [`Failover`], which combines a primary and a secondary land and survives
//!   the primary running out of nodes

pub mod cbs;
pub mod failover;
pub mod freelist;
pub mod node_pool;

use std::fmt;

use thiserror::Error;

use crate::range::Range;
use crate::zone::ZoneSet;

pub use cbs::Cbs;
pub use failover::Failover;
pub use freelist::Freelist;
pub use node_pool::{NodePool, NodePoolError};

/// Result type for land operations
pub type LandResult<T> = Result<T, LandError>;

/// Errors that can occur during land operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LandError {
    /// The request is void against the current contents: deleting a range
    /// the land does not hold, or inserting one that overlaps it.
    #[error("range {range} is not applicable to the land")]
    NotApplicable {
        /// The range that was refused
        range: Range,
    },

    /// The land could not grow its bookkeeping to perform a valid mutation.
    /// For a delete, `containing` is the block that would have been split.
    #[error("no bookkeeping capacity for {range}")]
    ResourceFailure {
        /// The range being inserted or deleted
        range: Range,
        /// The block a delete or find would have split
        containing: Option<Range>,
    },

    /// A structural self-check failed.
    #[error("land is inconsistent: {reason}")]
    Inconsistent {
        /// Which invariant failed
        reason: &'static str,
    },
}

impl LandError {
    /// Refuse `range`.
    pub fn not_applicable(range: Range) -> Self {
        Self::NotApplicable { range }
    }

    /// Report that bookkeeping for `range` ran out.
    pub fn resource_failure(range: Range, containing: Option<Range>) -> Self {
        Self::ResourceFailure { range, containing }
    }

    /// Report a failed self-check.
    pub fn inconsistent(reason: &'static str) -> Self {
        Self::Inconsistent { reason }
    }

    /// Returns true if the error reports a void request.
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Self::NotApplicable { .. })
    }

    /// Returns true if the error reports exhausted bookkeeping.
    pub fn is_resource_failure(&self) -> bool {
        matches!(self, Self::ResourceFailure { .. })
    }
}

/// What a successful find removes from the land
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindDelete {
    /// Leave the land unchanged and return the whole matching block
    None,
    /// Delete and return the low `size` bytes of the block
    Low,
    /// Delete and return the high `size` bytes of the block
    High,
    /// Delete and return the whole block
    Entire,
}

impl FindDelete {
    /// The part of `block` a find for `size` bytes returns
    pub fn part_of(self, block: Range, size: usize) -> Range {
        debug_assert!(block.size() >= size);
        match self {
            FindDelete::None | FindDelete::Entire => block,
            FindDelete::Low => Range::with_size(block.base(), size),
            FindDelete::High => Range::new(block.limit() - size, block.limit()),
        }
    }
}

/// A range returned by a find, with the block it was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Found {
    /// The range the caller asked for
    pub range: Range,
    /// The whole block before the find removed anything from it
    pub old_range: Range,
}

/// What an [`Land::iterate_and_delete`] visitor wants done with a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    /// Delete the visited range
    pub delete: bool,
    /// Carry on to the next range
    pub keep_going: bool,
}

impl Visit {
    /// Keep the range and continue
    pub const KEEP: Visit = Visit { delete: false, keep_going: true };
    /// Delete the range and continue
    pub const DELETE: Visit = Visit { delete: true, keep_going: true };
    /// Keep the range and stop
    pub const STOP: Visit = Visit { delete: false, keep_going: false };
}

/// The range-set contract.
///
/// Ranges handed to a land must be non-empty and aligned to
/// [`Land::alignment`]; breaking that is a caller bug caught by debug
/// assertions, not an error.
pub trait Land {
    /// Short name of the implementation, used by `describe`
    fn kind(&self) -> &'static str;

    /// Alignment of every range the land holds
    fn alignment(&self) -> usize;

    /// Total bytes held
    fn size(&self) -> usize;

    /// Insert `range`, returning the block it ended up in after coalescing.
    fn insert(&mut self, range: Range) -> LandResult<Range>;

    /// Insert `*range`, taking bookkeeping memory from its base if the land
    /// cannot otherwise grow. On return `*range` is the part not consumed.
    fn insert_steal(&mut self, range: &mut Range) -> LandResult<Range>;

    /// Delete `range`, returning the block that contained it.
    fn delete(&mut self, range: Range) -> LandResult<Range>;

    /// Delete `*range`, taking bookkeeping memory from its base if a split
    /// needs a node the land cannot otherwise get. On return `*range` is the
    /// part handed back to the caller.
    fn delete_steal(&mut self, range: &mut Range) -> LandResult<Range>;

    /// Visit every range in address order until the visitor returns false.
    /// Returns whether the visit ran to completion.
    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool;

    /// Visit every range in address order, deleting those the visitor asks
    /// for. Returns whether the visit ran to completion.
    fn iterate_and_delete(&mut self, visitor: &mut dyn FnMut(Range) -> Visit) -> bool;

    /// Find the lowest block of at least `size` bytes.
    fn find_first(&mut self, size: usize, find_delete: FindDelete) -> Option<Found>;

    /// Find the highest block of at least `size` bytes.
    fn find_last(&mut self, size: usize, find_delete: FindDelete) -> Option<Found>;

    /// Find the largest block, if it has at least `size` bytes. Ties go to
    /// the lowest address.
    fn find_largest(&mut self, size: usize, find_delete: FindDelete) -> Option<Found>;

    /// Find and delete `size` bytes lying wholly in `zones`, preferring high
    /// or low addresses. Fails if carving the range out needs bookkeeping the
    /// land cannot get.
    fn find_in_zones(
        &mut self,
        size: usize,
        zones: &ZoneSet,
        high: bool,
    ) -> LandResult<Option<Found>>;

    /// Check the land's structural invariants.
    fn check(&self) -> LandResult<()>;

    /// Write a diagnostic rendering, indented by `depth` spaces.
    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> fmt::Result {
        writeln!(
            out,
            "{:depth$}{} {{ size: {:#x}, alignment: {:#x} }}",
            "",
            self.kind(),
            self.size(),
            self.alignment(),
        )
    }
}

/// Move as many ranges as possible from `src` into `dest`.
///
/// Stops at the first range `dest` refuses, which stays in `src`. Returns
/// whether `src` was emptied.
pub fn flush(dest: &mut dyn Land, src: &mut dyn Land) -> bool {
    src.iterate_and_delete(&mut |range| match dest.insert(range) {
        Ok(_) => Visit::DELETE,
        Err(_) => Visit::STOP,
    })
}

/// Collect every range of `land` in iteration order
pub fn ranges(land: &dyn Land) -> Vec<Range> {
    let mut out = Vec::new();
    land.iterate(&mut |range| {
        out.push(range);
        true
    });
    out
}

/// Render `land` with [`Land::describe`] into a string
pub fn describe_to_string(land: &dyn Land) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = land.describe(&mut out, 0);
    out
}

/// The largest block of at least `size` bytes, ties to the lowest address
pub(crate) fn largest_of(blocks: impl Iterator<Item = Range>, size: usize) -> Option<Range> {
    let mut best: Option<Range> = None;
    for block in blocks {
        if block.size() >= size && best.map_or(true, |b| block.size() > b.size()) {
            best = Some(block);
        }
    }
    best
}

/// The first block (in the iterator's order) with a `size`-byte zone fit,
/// paired with the fit
pub(crate) fn zone_fit_of(
    blocks: impl Iterator<Item = Range>,
    size: usize,
    zones: &ZoneSet,
    high: bool,
) -> Option<Found> {
    blocks
        .filter(|block| block.size() >= size)
        .find_map(|block| {
            zones.fit(block, size, high).map(|range| Found {
                range,
                old_range: block,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_delete_parts() {
        let block = Range::new(0x1000, 0x3000);
        assert_eq!(FindDelete::Low.part_of(block, 0x800), Range::new(0x1000, 0x1800));
        assert_eq!(FindDelete::High.part_of(block, 0x800), Range::new(0x2800, 0x3000));
        assert_eq!(FindDelete::Entire.part_of(block, 0x800), block);
        assert_eq!(FindDelete::None.part_of(block, 0x800), block);
    }

    #[test]
    fn test_largest_of_prefers_lowest_on_ties() {
        let blocks = [
            Range::new(0, 16),
            Range::new(32, 64),
            Range::new(96, 128),
            Range::new(160, 176),
        ];
        assert_eq!(largest_of(blocks.iter().copied(), 8), Some(Range::new(32, 64)));
        assert_eq!(largest_of(blocks.iter().copied(), 64), None);
    }

    #[test]
    fn test_error_classification() {
        let r = Range::new(0, 16);
        assert!(LandError::not_applicable(r).is_not_applicable());
        assert!(LandError::resource_failure(r, None).is_resource_failure());
        assert!(!LandError::inconsistent("bad").is_resource_failure());
    }

    #[test]
    fn test_flush_moves_everything() {
        let mut dest = Freelist::new(16);
        let mut src = Freelist::new(16);
        src.insert(Range::new(0, 32)).unwrap();
        src.insert(Range::new(64, 96)).unwrap();

        assert!(flush(&mut dest, &mut src));
        assert_eq!(src.size(), 0);
        assert_eq!(ranges(&dest), vec![Range::new(0, 32), Range::new(64, 96)]);
    }

    #[test]
    fn test_flush_stops_at_refusal() {
        let mut dest = Cbs::new(crate::config::CbsConfig::default().with_alignment(16).with_node_limit(1));
        let mut src = Freelist::new(16);
        src.insert(Range::new(0, 32)).unwrap();
        src.insert(Range::new(64, 96)).unwrap();

        assert!(!flush(&mut dest, &mut src));
        assert_eq!(ranges(&dest), vec![Range::new(0, 32)]);
        assert_eq!(ranges(&src), vec![Range::new(64, 96)]);
    }
}
