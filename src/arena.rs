//! Simulated address arena
//!
//! The arena reserves a window of address space and hands it out to pools in
//! grain-aligned spans. It never touches memory; it only keeps the books,
//! holding its free spans in a [`Freelist`] and refusing requests that would
//! take the handed-out total past the commit limit.

use thiserror::Error;
use tracing::{debug, trace};

use crate::config::ArenaConfig;
use crate::error::Result;
use crate::land::{FindDelete, Freelist, Land};
use crate::range::{align_up, Range};
use crate::zone::ZoneSet;

/// Errors that can occur when taking spans from or returning them to an arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArenaError {
    /// No free span is large enough.
    #[error("arena cannot supply {size:#x} bytes")]
    Exhausted {
        /// Requested bytes after rounding to the grain
        size: usize,
    },

    /// Handing the span out would pass the commit limit.
    #[error("commit limit {limit:#x} reached, cannot commit {size:#x} more bytes")]
    CommitLimit {
        /// Requested bytes after rounding to the grain
        size: usize,
        /// The configured commit limit
        limit: usize,
    },

    /// The span was not handed out by this arena, or was already returned.
    #[error("span {range} is not held by the arena's clients")]
    NotOwned {
        /// The rejected span
        range: Range,
    },
}

impl ArenaError {
    /// Returns true if the arena is out of space or over its limit.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::CommitLimit { .. })
    }
}

/// Result type for arena operations
pub type ArenaResult<T> = std::result::Result<T, ArenaError>;

/// Source of grain-aligned address space
#[derive(Debug, Clone)]
pub struct AddressArena {
    config: ArenaConfig,
    reserved: Range,
    free: Freelist,
    committed: usize,
}

impl AddressArena {
    /// Create an arena over the window `config` describes.
    pub fn new(config: ArenaConfig) -> Result<Self> {
        config.validate()?;
        let reserved = Range::with_size(config.base, config.reserve);
        let mut free = Freelist::new(config.grain);
        free.insert(reserved)?;
        debug!(%reserved, grain = config.grain, "arena reserved");
        Ok(Self {
            config,
            reserved,
            free,
            committed: 0,
        })
    }

    /// Alignment and rounding unit of every span handed out
    pub fn grain(&self) -> usize {
        self.config.grain
    }

    /// The whole reserved window
    pub fn reserved(&self) -> Range {
        self.reserved
    }

    /// Bytes currently handed out
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Bytes not handed out
    pub fn available(&self) -> usize {
        self.free.size()
    }

    /// Most bytes that may be handed out at once, if bounded
    pub fn commit_limit(&self) -> Option<usize> {
        self.config.commit_limit
    }

    /// Change the commit limit. Spans already handed out stay valid.
    pub fn set_commit_limit(&mut self, limit: Option<usize>) {
        self.config.commit_limit = limit;
    }

    /// The zones `range` touches
    pub fn zones_of(&self, range: Range) -> ZoneSet {
        ZoneSet::of_range(self.config.zone_shift, range)
    }

    fn reserve_commit(&self, size: usize) -> ArenaResult<()> {
        match self.config.commit_limit {
            Some(limit) if self.committed + size > limit => {
                Err(ArenaError::CommitLimit { size, limit })
            }
            _ => Ok(()),
        }
    }

    /// Hand out `size` bytes rounded up to the grain, from the lowest or
    /// highest free span.
    pub fn alloc(&mut self, size: usize, high: bool) -> ArenaResult<Range> {
        debug_assert!(size > 0);
        let size = align_up(size, self.config.grain);
        self.reserve_commit(size)?;

        let found = if high {
            self.free.find_last(size, FindDelete::High)
        } else {
            self.free.find_first(size, FindDelete::Low)
        };
        let span = found.ok_or(ArenaError::Exhausted { size })?.range;
        self.committed += size;
        trace!(%span, committed = self.committed, "arena span handed out");
        Ok(span)
    }

    /// Hand out `size` bytes lying wholly within `zones`.
    pub fn alloc_in_zones(&mut self, size: usize, zones: &ZoneSet, high: bool) -> ArenaResult<Range> {
        debug_assert!(size > 0);
        let size = align_up(size, self.config.grain);
        self.reserve_commit(size)?;

        // The freelist never needs bookkeeping to carve.
        let found = self
            .free
            .find_in_zones(size, zones, high)
            .ok()
            .flatten()
            .ok_or(ArenaError::Exhausted { size })?;
        self.committed += size;
        trace!(span = %found.range, committed = self.committed, "arena zoned span handed out");
        Ok(found.range)
    }

    /// Take back a span handed out earlier.
    pub fn free(&mut self, range: Range) -> ArenaResult<()> {
        if range.is_empty() || !range.is_aligned(self.config.grain) || !self.reserved.nests(&range) {
            return Err(ArenaError::NotOwned { range });
        }
        self.free
            .insert(range)
            .map_err(|_| ArenaError::NotOwned { range })?;
        self.committed -= range.size();
        trace!(%range, committed = self.committed, "arena span returned");
        Ok(())
    }
}
