//! Coalescing block structure
//!
//! The CBS keeps free blocks in an ordered map from base to limit and merges
//! every block with its neighbours on insert, so no two blocks are ever
//! adjacent. Each block costs one node from a [`NodePool`]; inserting an
//! isolated range and deleting from the middle of a block both need a fresh
//! node and fail with [`LandError::ResourceFailure`] when the pool cannot
//! grow. This makes it a good primary land for a [`Failover`](super::Failover).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::{Excluded, Unbounded};

use crate::config::CbsConfig;
use crate::range::{align_up, Addr, Range};
use crate::zone::ZoneSet;

use super::{
    largest_of, zone_fit_of, FindDelete, Found, Land, LandError, LandResult, NodePool,
    NodePoolError, Visit,
};

/// Coalescing block structure
#[derive(Debug, Clone)]
pub struct Cbs {
    /// Blocks keyed by base, valued by limit
    blocks: BTreeMap<Addr, Addr>,
    /// Sum of block sizes
    size: usize,
    alignment: usize,
    nodes: NodePool,
}

impl Cbs {
    /// Create an empty CBS with a node pool built from `config`.
    pub fn new(config: CbsConfig) -> Self {
        debug_assert!(config.alignment.is_power_of_two());
        Self {
            blocks: BTreeMap::new(),
            size: 0,
            alignment: config.alignment,
            nodes: NodePool::new(&config),
        }
    }

    /// Number of blocks held
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The pool that supplies bookkeeping nodes
    pub fn node_pool(&self) -> &NodePool {
        &self.nodes
    }

    /// Mutable access to the node pool, for tuning or starving it
    pub fn node_pool_mut(&mut self) -> &mut NodePool {
        &mut self.nodes
    }

    /// Bytes a steal takes from a range to build one node
    fn steal_size(&self) -> usize {
        align_up(self.nodes.node_size(), self.alignment)
    }

    /// The block starting at or below `addr`
    fn block_at_or_below(&self, addr: Addr) -> Option<Range> {
        self.blocks
            .range(..=addr)
            .next_back()
            .map(|(&base, &limit)| Range::new(base, limit))
    }

    /// The block starting strictly above `addr`
    fn block_above(&self, addr: Addr) -> Option<Range> {
        self.blocks
            .range((Excluded(addr), Unbounded))
            .next()
            .map(|(&base, &limit)| Range::new(base, limit))
    }

    /// The block nesting `range`, or `NotApplicable`
    fn containing(&self, range: Range) -> LandResult<Range> {
        self.block_at_or_below(range.base())
            .filter(|block| block.nests(&range))
            .ok_or(LandError::not_applicable(range))
    }

    fn check_range(&self, range: &Range) {
        debug_assert!(!range.is_empty(), "empty range {range}");
        debug_assert!(range.is_aligned(self.alignment), "misaligned range {range}");
    }

    /// Remove `part` from `block`, which must nest it. Only a cut from the
    /// middle of the block needs a node.
    fn carve(&mut self, block: Range, part: Range) -> Result<(), NodePoolError> {
        debug_assert!(block.nests(&part));
        let left = block.left_of(&part);
        let right = block.right_of(&part);
        match (left.is_empty(), right.is_empty()) {
            (true, true) => {
                self.blocks.remove(&block.base());
                self.nodes.free();
            }
            (true, false) => {
                self.blocks.remove(&block.base());
                self.blocks.insert(right.base(), right.limit());
            }
            (false, true) => {
                self.blocks.insert(left.base(), left.limit());
            }
            (false, false) => {
                self.nodes.alloc()?;
                self.blocks.insert(left.base(), left.limit());
                self.blocks.insert(right.base(), right.limit());
            }
        }
        self.size -= part.size();
        Ok(())
    }

    /// Apply a find's delete policy to `block`
    fn take(&mut self, block: Range, size: usize, find_delete: FindDelete) -> Option<Found> {
        let range = find_delete.part_of(block, size);
        if find_delete != FindDelete::None {
            // Trimming an end never needs a node.
            self.carve(block, range).ok()?;
        }
        Some(Found {
            range,
            old_range: block,
        })
    }

    fn iter_blocks(&self) -> impl DoubleEndedIterator<Item = Range> + '_ {
        self.blocks
            .iter()
            .map(|(&base, &limit)| Range::new(base, limit))
    }
}

impl Land for Cbs {
    fn kind(&self) -> &'static str {
        "cbs"
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn size(&self) -> usize {
        self.size
    }

    fn insert(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);

        let left = self.block_at_or_below(range.base());
        let right = self.block_above(range.base());
        if left.is_some_and(|l| l.overlaps(&range)) || right.is_some_and(|r| r.overlaps(&range)) {
            return Err(LandError::not_applicable(range));
        }

        let left = left.filter(|l| l.limit() == range.base());
        let right = right.filter(|r| r.base() == range.limit());
        let merged = match (left, right) {
            (Some(l), Some(r)) => {
                self.blocks.remove(&r.base());
                self.blocks.insert(l.base(), r.limit());
                self.nodes.free();
                Range::new(l.base(), r.limit())
            }
            (Some(l), None) => {
                self.blocks.insert(l.base(), range.limit());
                Range::new(l.base(), range.limit())
            }
            (None, Some(r)) => {
                self.blocks.remove(&r.base());
                self.blocks.insert(range.base(), r.limit());
                Range::new(range.base(), r.limit())
            }
            (None, None) => {
                if let Err(err) = self.nodes.alloc() {
                    tracing::trace!(%range, %err, "cbs cannot allocate a node for insert");
                    return Err(LandError::resource_failure(range, None));
                }
                self.blocks.insert(range.base(), range.limit());
                range
            }
        };
        self.size += range.size();
        Ok(merged)
    }

    fn insert_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.check_range(range);
        match self.insert(*range) {
            Err(LandError::ResourceFailure { .. }) => {}
            other => return other,
        }

        let steal = self.steal_size();
        if range.size() <= steal {
            return Err(LandError::resource_failure(*range, None));
        }
        self.nodes.donate(steal);
        *range = Range::new(range.base() + steal, range.limit());
        tracing::trace!(%range, steal, "cbs stole node memory on insert");
        self.insert(*range)
    }

    fn delete(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);
        let block = self.containing(range)?;
        match self.carve(block, range) {
            Ok(()) => Ok(block),
            Err(err) => {
                tracing::trace!(%range, %block, %err, "cbs cannot allocate a node to split");
                Err(LandError::resource_failure(range, Some(block)))
            }
        }
    }

    fn delete_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.check_range(range);
        match self.delete(*range) {
            Err(LandError::ResourceFailure {
                containing: Some(block),
                ..
            }) => {
                let steal = self.steal_size();
                if range.size() <= steal {
                    return Err(LandError::resource_failure(*range, Some(block)));
                }
                // The stolen prefix becomes node storage and leaves the land
                // with the rest of the range.
                self.nodes.donate(steal);
                self.carve(block, *range)
                    .map_err(|_| LandError::resource_failure(*range, Some(block)))?;
                *range = Range::new(range.base() + steal, range.limit());
                tracing::trace!(%range, steal, "cbs stole node memory on delete");
                Ok(block)
            }
            other => other,
        }
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool {
        self.iter_blocks().all(|block| visitor(block))
    }

    fn iterate_and_delete(&mut self, visitor: &mut dyn FnMut(Range) -> Visit) -> bool {
        let mut cursor = 0;
        loop {
            let next = self.blocks.range(cursor..).next().map(|(&b, &l)| Range::new(b, l));
            let Some(block) = next else {
                return true;
            };
            let base = block.base();
            let limit = block.limit();
            let visit = visitor(block);
            if visit.delete {
                self.blocks.remove(&base);
                self.nodes.free();
                self.size -= block.size();
            }
            if !visit.keep_going {
                return false;
            }
            cursor = limit;
        }
    }

    fn find_first(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let block = self.iter_blocks().find(|b| b.size() >= size)?;
        self.take(block, size, find_delete)
    }

    fn find_last(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let block = self.iter_blocks().rev().find(|b| b.size() >= size)?;
        self.take(block, size, find_delete)
    }

    fn find_largest(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let block = largest_of(self.iter_blocks(), size)?;
        self.take(block, size, find_delete)
    }

    fn find_in_zones(
        &mut self,
        size: usize,
        zones: &ZoneSet,
        high: bool,
    ) -> LandResult<Option<Found>> {
        let found = if high {
            zone_fit_of(self.iter_blocks().rev(), size, zones, high)
        } else {
            zone_fit_of(self.iter_blocks(), size, zones, high)
        };
        let Some(found) = found else {
            return Ok(None);
        };
        self.carve(found.old_range, found.range)
            .map_err(|_| LandError::resource_failure(found.range, Some(found.old_range)))?;
        Ok(Some(found))
    }

    fn check(&self) -> LandResult<()> {
        let mut total = 0;
        let mut prev: Option<Range> = None;
        for block in self.iter_blocks() {
            if block.is_empty() {
                return Err(LandError::inconsistent("cbs holds an empty block"));
            }
            if !block.is_aligned(self.alignment) {
                return Err(LandError::inconsistent("cbs block is misaligned"));
            }
            if prev.is_some_and(|p| p.limit() >= block.base()) {
                return Err(LandError::inconsistent("cbs blocks overlap or were not coalesced"));
            }
            total += block.size();
            prev = Some(block);
        }
        if total != self.size {
            return Err(LandError::inconsistent("cbs size does not match its blocks"));
        }
        if self.nodes.in_use() != self.blocks.len() || self.nodes.in_use() > self.nodes.capacity() {
            return Err(LandError::inconsistent("cbs node accounting is off"));
        }
        Ok(())
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> fmt::Result {
        writeln!(
            out,
            "{:depth$}cbs {{ size: {:#x}, alignment: {:#x}, blocks: {}, nodes: {}/{} }}",
            "",
            self.size,
            self.alignment,
            self.blocks.len(),
            self.nodes.in_use(),
            self.nodes.capacity(),
        )?;
        for block in self.iter_blocks() {
            writeln!(out, "{:width$}{}", "", block, width = depth + 2)?;
        }
        Ok(())
    }
}
