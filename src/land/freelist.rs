//! Freelist land
//!
//! The freelist keeps its blocks in a sorted vector and coalesces adjacent
//! blocks on insert. Its bookkeeping lives inside the free blocks themselves,
//! so it never reports [`LandError::ResourceFailure`]. Searches are linear,
//! which makes it a poor primary but a dependable secondary.

use std::fmt;

use crate::range::Range;
use crate::zone::ZoneSet;

use super::{largest_of, zone_fit_of, FindDelete, Found, Land, LandError, LandResult, Visit};

/// Sorted, coalescing list of free blocks
#[derive(Debug, Clone)]
pub struct Freelist {
    blocks: Vec<Range>,
    size: usize,
    alignment: usize,
}

impl Freelist {
    /// Create an empty freelist holding ranges aligned to `alignment`.
    pub fn new(alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            blocks: Vec::new(),
            size: 0,
            alignment,
        }
    }

    /// Number of blocks held
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn check_range(&self, range: &Range) {
        debug_assert!(!range.is_empty(), "empty range {range}");
        debug_assert!(range.is_aligned(self.alignment), "misaligned range {range}");
    }

    /// Index of the block nesting `range`
    fn containing(&self, range: Range) -> LandResult<usize> {
        let idx = self.blocks.partition_point(|b| b.base() <= range.base());
        idx.checked_sub(1)
            .filter(|&i| self.blocks[i].nests(&range))
            .ok_or(LandError::not_applicable(range))
    }

    /// Remove `part` from the block at `idx`, which must nest it
    fn carve(&mut self, idx: usize, part: Range) {
        let block = self.blocks[idx];
        debug_assert!(block.nests(&part));
        let left = block.left_of(&part);
        let right = block.right_of(&part);
        match (left.is_empty(), right.is_empty()) {
            (true, true) => {
                self.blocks.remove(idx);
            }
            (true, false) => self.blocks[idx] = right,
            (false, true) => self.blocks[idx] = left,
            (false, false) => {
                self.blocks[idx] = left;
                self.blocks.insert(idx + 1, right);
            }
        }
        self.size -= part.size();
    }

    fn take(&mut self, idx: usize, size: usize, find_delete: FindDelete) -> Found {
        let block = self.blocks[idx];
        let range = find_delete.part_of(block, size);
        if find_delete != FindDelete::None {
            self.carve(idx, range);
        }
        Found {
            range,
            old_range: block,
        }
    }

    fn index_of(&self, block: Range) -> usize {
        self.blocks.partition_point(|b| b.base() < block.base())
    }
}

impl Land for Freelist {
    fn kind(&self) -> &'static str {
        "freelist"
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn size(&self) -> usize {
        self.size
    }

    fn insert(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);
        let idx = self.blocks.partition_point(|b| b.base() < range.base());
        let left = idx.checked_sub(1).map(|i| self.blocks[i]);
        let right = self.blocks.get(idx).copied();
        if left.is_some_and(|l| l.overlaps(&range)) || right.is_some_and(|r| r.overlaps(&range)) {
            return Err(LandError::not_applicable(range));
        }

        let joins_left = left.is_some_and(|l| l.limit() == range.base());
        let joins_right = right.is_some_and(|r| r.base() == range.limit());
        let merged = match (joins_left, joins_right) {
            (true, true) => {
                let merged = Range::new(self.blocks[idx - 1].base(), self.blocks[idx].limit());
                self.blocks[idx - 1] = merged;
                self.blocks.remove(idx);
                merged
            }
            (true, false) => {
                let merged = Range::new(self.blocks[idx - 1].base(), range.limit());
                self.blocks[idx - 1] = merged;
                merged
            }
            (false, true) => {
                let merged = Range::new(range.base(), self.blocks[idx].limit());
                self.blocks[idx] = merged;
                merged
            }
            (false, false) => {
                self.blocks.insert(idx, range);
                range
            }
        };
        self.size += range.size();
        Ok(merged)
    }

    fn insert_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.insert(*range)
    }

    fn delete(&mut self, range: Range) -> LandResult<Range> {
        self.check_range(&range);
        let idx = self.containing(range)?;
        let block = self.blocks[idx];
        self.carve(idx, range);
        Ok(block)
    }

    fn delete_steal(&mut self, range: &mut Range) -> LandResult<Range> {
        self.delete(*range)
    }

    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool {
        self.blocks.iter().all(|&block| visitor(block))
    }

    fn iterate_and_delete(&mut self, visitor: &mut dyn FnMut(Range) -> Visit) -> bool {
        let mut idx = 0;
        while idx < self.blocks.len() {
            let block = self.blocks[idx];
            let visit = visitor(block);
            if visit.delete {
                self.blocks.remove(idx);
                self.size -= block.size();
            } else {
                idx += 1;
            }
            if !visit.keep_going {
                return false;
            }
        }
        true
    }

    fn find_first(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let idx = self.blocks.iter().position(|b| b.size() >= size)?;
        Some(self.take(idx, size, find_delete))
    }

    fn find_last(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let idx = self.blocks.iter().rposition(|b| b.size() >= size)?;
        Some(self.take(idx, size, find_delete))
    }

    fn find_largest(&mut self, size: usize, find_delete: FindDelete) -> Option<Found> {
        let block = largest_of(self.blocks.iter().copied(), size)?;
        let idx = self.index_of(block);
        Some(self.take(idx, size, find_delete))
    }

    fn find_in_zones(
        &mut self,
        size: usize,
        zones: &ZoneSet,
        high: bool,
    ) -> LandResult<Option<Found>> {
        let found = if high {
            zone_fit_of(self.blocks.iter().rev().copied(), size, zones, high)
        } else {
            zone_fit_of(self.blocks.iter().copied(), size, zones, high)
        };
        if let Some(found) = found {
            let idx = self.index_of(found.old_range);
            self.carve(idx, found.range);
        }
        Ok(found)
    }

    fn check(&self) -> LandResult<()> {
        let mut total = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.is_empty() {
                return Err(LandError::inconsistent("freelist holds an empty block"));
            }
            if !block.is_aligned(self.alignment) {
                return Err(LandError::inconsistent("freelist block is misaligned"));
            }
            if i > 0 && self.blocks[i - 1].limit() >= block.base() {
                return Err(LandError::inconsistent("freelist blocks overlap or were not coalesced"));
            }
            total += block.size();
        }
        if total != self.size {
            return Err(LandError::inconsistent("freelist size does not match its blocks"));
        }
        Ok(())
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> fmt::Result {
        writeln!(
            out,
            "{:depth$}freelist {{ size: {:#x}, alignment: {:#x}, blocks: {} }}",
            "",
            self.size,
            self.alignment,
            self.blocks.len(),
        )
    }
}
