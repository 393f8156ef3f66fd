//! Manual free-first-fit pool
//!
//! The pool takes address space from an [`AddressArena`] in large spans and
//! carves client allocations out of them. Its free space lives in a
//! [`Failover`] over a node-limited [`Cbs`] and a [`Freelist`], so frees
//! succeed even when the CBS cannot grow. A second CBS records the total
//! span taken from the arena. When free space passes the configured spare
//! fraction of the total, whole grains go back to the arena.
//!
//! The failover is rebuilt for each operation over the sub-lands the pool
//! owns; it holds nothing but the two borrows and the alignment.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::arena::AddressArena;
use crate::config::{ArenaConfig, CbsConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::land::{Cbs, Failover, FindDelete, Freelist, Land, LandError};
use crate::range::{align_down, align_up, Range};

/// Snapshot of a pool's accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Bytes taken from the arena
    pub total: usize,
    /// Bytes free in the pool
    pub free: usize,
    /// Free bytes held by the CBS
    pub primary_free: usize,
    /// Free bytes held by the freelist
    pub secondary_free: usize,
    /// Blocks held by the CBS
    pub primary_blocks: usize,
    /// Blocks held by the freelist
    pub secondary_blocks: usize,
    /// Times the pool took a span from the arena
    pub extensions: usize,
    /// Bytes handed back to the arena
    pub returned: usize,
}

/// Manual free-first-fit pool
#[derive(Debug)]
pub struct MvffPool {
    config: PoolConfig,
    arena: AddressArena,
    /// Every span taken from the arena and not yet returned
    total: Cbs,
    primary: Cbs,
    secondary: Freelist,
    extensions: usize,
    returned: usize,
}

impl MvffPool {
    /// Create a pool drawing on `arena`.
    pub fn new(config: PoolConfig, arena: AddressArena) -> Result<Self> {
        config.validate()?;
        if config.alignment > arena.grain() {
            return Err(Error::config("pool alignment exceeds the arena grain"));
        }
        let alignment = config.alignment;
        Ok(Self {
            total: Cbs::new(CbsConfig::default().with_alignment(alignment)),
            primary: Cbs::new(config.cbs.with_alignment(alignment)),
            secondary: Freelist::new(alignment),
            config,
            arena,
            extensions: 0,
            returned: 0,
        })
    }

    /// Create a pool with its own arena.
    pub fn with_arena_config(config: PoolConfig, arena: ArenaConfig) -> Result<Self> {
        Self::new(config, AddressArena::new(arena)?)
    }

    /// The configuration the pool was built with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The arena the pool extends from
    pub fn arena(&self) -> &AddressArena {
        &self.arena
    }

    /// The land holding the pool's free space
    pub fn free_land(&mut self) -> Result<Failover<'_>> {
        Ok(Failover::new(
            &mut self.primary,
            &mut self.secondary,
            self.config.alignment,
        )?)
    }

    /// Bytes taken from the arena
    pub fn size(&self) -> usize {
        self.total.size()
    }

    /// Bytes free in the pool
    pub fn free_size(&self) -> usize {
        self.primary.size() + self.secondary.size()
    }

    /// Snapshot the pool's accounting
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.size(),
            free: self.free_size(),
            primary_free: self.primary.size(),
            secondary_free: self.secondary.size(),
            primary_blocks: self.primary.block_count(),
            secondary_blocks: self.secondary.block_count(),
            extensions: self.extensions,
            returned: self.returned,
        }
    }

    /// Allocate `size` bytes, rounded up to the pool's alignment.
    pub fn alloc(&mut self, size: usize) -> Result<Range> {
        if size == 0 {
            return Err(Error::ZeroSize);
        }
        let size = align_up(size, self.config.alignment);

        if let Some(range) = self.find_free(size)? {
            trace!(%range, "pool allocated");
            return Ok(range);
        }
        self.extend(size)?;
        let range = self
            .find_free(size)?
            .ok_or(LandError::inconsistent("pool extension did not satisfy the request"))?;
        trace!(%range, "pool allocated after extending");
        Ok(range)
    }

    /// Free `range`, which must have come from [`MvffPool::alloc`].
    pub fn free(&mut self, range: Range) -> Result<()> {
        let range = Range::new(range.base(), align_up(range.limit(), self.config.alignment));
        if range.is_empty() {
            return Err(Error::ZeroSize);
        }
        if self.total.iterate(&mut |span| !span.nests(&range)) {
            return Err(LandError::not_applicable(range).into());
        }
        // The failover only sees overlaps in whichever sub-land takes the
        // insert, so look at both first.
        let mut land = self.free_land()?;
        if !land.iterate(&mut |block| !block.overlaps(&range)) {
            return Err(LandError::not_applicable(range).into());
        }
        land.insert(range)?;
        trace!(%range, "pool freed");
        self.reduce()
    }

    fn find_free(&mut self, size: usize) -> Result<Option<Range>> {
        let PoolConfig {
            first_fit,
            slot_high,
            ..
        } = self.config;
        let find_delete = if slot_high { FindDelete::High } else { FindDelete::Low };

        let mut land = self.free_land()?;
        let found = match (first_fit, slot_high) {
            (true, false) => land.find_first(size, find_delete),
            (true, true) => land.find_last(size, find_delete),
            (false, _) => land.find_largest(size, find_delete),
        };
        Ok(found.map(|found| found.range))
    }

    /// Take at least `size` bytes from the arena and add them to free space.
    fn extend(&mut self, size: usize) -> Result<()> {
        let high = self.config.arena_high;
        let want = size.max(self.config.extend_by);
        let span = match self.arena.alloc(want, high) {
            Ok(span) => span,
            Err(err) if err.is_exhausted() && want > size => {
                warn!(want, size, %err, "arena cannot supply a full extension, taking the request only");
                self.arena.alloc(size, high)?
            }
            Err(err) => return Err(err.into()),
        };

        self.total.insert(span)?;
        self.free_land()?.insert(span)?;
        self.extensions += 1;
        debug!(%span, total = self.total.size(), "pool extended");
        Ok(())
    }

    /// Return whole grains to the arena while free space exceeds the spare
    /// fraction of the total.
    fn reduce(&mut self) -> Result<()> {
        let grain = self.arena.grain();
        loop {
            let free = self.free_size();
            let keep = (self.config.spare * self.total.size() as f64) as usize;
            let excess = align_down(free.saturating_sub(keep), grain);
            if excess == 0 {
                return Ok(());
            }

            // The largest run of whole grains in any free block, whichever
            // sub-land holds it.
            let mut best: Option<Range> = None;
            self.free_land()?.iterate(&mut |block| {
                let base = align_up(block.base(), grain);
                let limit = align_down(block.limit(), grain);
                if limit > base && best.is_none_or(|b| limit - base > b.size()) {
                    best = Some(Range::new(base, limit));
                }
                true
            });
            let Some(whole) = best else {
                return Ok(());
            };
            let span = Range::with_size(whole.base(), whole.size().min(excess));

            self.free_land()?.delete(span)?;
            self.total.delete(span)?;
            self.arena.free(span)?;
            self.returned += span.size();
            debug!(%span, total = self.total.size(), "pool returned span to the arena");
        }
    }

    /// Check the pool's lands and its accounting.
    pub fn check(&mut self) -> Result<()> {
        self.total.check()?;
        let total = self.total.size();
        let land = self.free_land()?;
        land.check()?;
        if land.size() > total {
            return Err(LandError::inconsistent("pool holds more free space than it spans").into());
        }
        Ok(())
    }

    /// Render the pool and its lands for diagnostics.
    pub fn describe(&mut self) -> Result<String> {
        let mut out = String::new();
        let stats = self.stats();
        // Writing to a String cannot fail.
        let _ = writeln!(
            out,
            "mvff {{ total: {:#x}, free: {:#x}, extensions: {}, returned: {:#x} }}",
            stats.total, stats.free, stats.extensions, stats.returned
        );
        let _ = self.free_land()?.describe(&mut out, 2);
        Ok(out)
    }
}

/// Pool shared between threads behind a mutex
#[derive(Debug, Clone)]
pub struct SharedPool {
    inner: Arc<Mutex<MvffPool>>,
}

impl SharedPool {
    /// Wrap `pool` for sharing.
    pub fn new(pool: MvffPool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pool)),
        }
    }

    /// See [`MvffPool::alloc`].
    pub fn alloc(&self, size: usize) -> Result<Range> {
        self.inner.lock().alloc(size)
    }

    /// See [`MvffPool::free`].
    pub fn free(&self, range: Range) -> Result<()> {
        self.inner.lock().free(range)
    }

    /// Bytes taken from the arena
    pub fn size(&self) -> usize {
        self.inner.lock().size()
    }

    /// Bytes free in the pool
    pub fn free_size(&self) -> usize {
        self.inner.lock().free_size()
    }

    /// Snapshot the pool's accounting
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    /// Run `f` with exclusive access to the pool.
    pub fn with<R>(&self, f: impl FnOnce(&mut MvffPool) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::land::ranges;
    use std::thread;

    const GRAIN: usize = 0x1000;

    fn arena_config() -> ArenaConfig {
        ArenaConfig::default()
            .with_base(0x100_0000)
            .with_reserve(0x100_0000)
            .with_grain(GRAIN)
            .with_zone_shift(20)
    }

    fn pool(config: PoolConfig) -> MvffPool {
        MvffPool::with_arena_config(config, arena_config()).unwrap()
    }

    fn small_config() -> PoolConfig {
        PoolConfig::default().with_extend_by(0x4000)
    }

    #[test]
    fn test_alloc_extends_and_rounds() {
        let mut pool = pool(small_config());
        let range = pool.alloc(10).unwrap();
        assert_eq!(range, Range::new(0x100_0000, 0x100_0010));
        assert_eq!(pool.size(), 0x4000);
        assert_eq!(pool.free_size(), 0x4000 - 0x10);
        assert_eq!(pool.stats().extensions, 1);
        pool.check().unwrap();
    }

    #[test]
    fn test_large_alloc_takes_exact_grains() {
        let mut pool = pool(small_config());
        let range = pool.alloc(0x5001).unwrap();
        assert_eq!(range.size(), 0x5008);
        assert_eq!(pool.size(), 0x6000);
    }

    #[test]
    fn test_slot_high_allocates_from_the_top() {
        let mut pool = pool(small_config().with_slot_high(true));
        let range = pool.alloc(0x100).unwrap();
        assert_eq!(range.limit(), 0x100_4000);
    }

    #[test]
    fn test_arena_high_takes_top_span() {
        let mut pool = pool(small_config().with_arena_high(true));
        let range = pool.alloc(0x100).unwrap();
        assert_eq!(range.base(), 0x200_0000 - 0x4000);
    }

    #[test]
    fn test_largest_fit() {
        let mut pool = pool(small_config().with_first_fit(false).with_spare(1.0));
        let a = pool.alloc(0x100).unwrap();
        let _b = pool.alloc(0x100).unwrap();
        pool.free(a).unwrap();
        // The freed hole is smaller than the tail, so largest-fit skips it.
        let c = pool.alloc(0x80).unwrap();
        assert_eq!(c.base(), 0x100_0200);
    }

    #[test]
    fn test_free_then_reuse() {
        let mut pool = pool(small_config().with_spare(1.0));
        let a = pool.alloc(0x100).unwrap();
        let b = pool.alloc(0x100).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.alloc(0x100).unwrap(), a);
        pool.free(b).unwrap();
        pool.check().unwrap();
    }

    #[test]
    fn test_free_rejects_double_and_foreign() {
        let mut pool = pool(small_config().with_spare(1.0));
        let a = pool.alloc(0x100).unwrap();
        pool.free(a).unwrap();
        let err = pool.free(a).unwrap_err();
        assert!(matches!(err, Error::Land(e) if e.is_not_applicable()));

        let err = pool.free(Range::new(0x10, 0x20)).unwrap_err();
        assert!(matches!(err, Error::Land(e) if e.is_not_applicable()));
        assert_eq!(pool.alloc(0).unwrap_err(), Error::ZeroSize);
    }

    #[test]
    fn test_reduce_returns_grains() {
        let mut pool = pool(small_config().with_spare(0.0));
        let a = pool.alloc(0x100).unwrap();
        let b = pool.alloc(0x100).unwrap();
        pool.free(a).unwrap();
        // Only whole free grains go back, and the first grain is still in use.
        assert_eq!(pool.size(), GRAIN);
        assert_eq!(pool.arena().committed(), GRAIN);
        pool.free(b).unwrap();
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.free_size(), 0);
        assert_eq!(pool.stats().returned, 0x4000);
        pool.check().unwrap();
    }

    #[test]
    fn test_spare_keeps_free_space() {
        let mut pool = pool(small_config().with_spare(0.5));
        let a = pool.alloc(0x4000).unwrap();
        pool.free(a).unwrap();
        // Grains go back until less than one grain of excess remains.
        assert_eq!(pool.size(), 0x1000);
        assert_eq!(pool.free_size(), 0x1000);
        assert_eq!(pool.stats().returned, 0x3000);
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut pool = MvffPool::with_arena_config(
            small_config(),
            arena_config().with_reserve(0x2000),
        )
        .unwrap();
        // A full extension does not fit, the exact request does.
        pool.alloc(0x1000).unwrap();
        assert_eq!(pool.size(), 0x1000);
        assert!(pool.alloc(0x3000).unwrap_err().is_exhausted());
    }

    #[test]
    fn test_double_free_caught_in_secondary() {
        let config = small_config()
            .with_spare(1.0)
            .with_cbs(CbsConfig::default().with_extend_by(1).with_node_limit(2));
        let mut pool = pool(config);
        let blocks: Vec<Range> = (0..16).map(|_| pool.alloc(0x40).unwrap()).collect();

        pool.free(blocks[0]).unwrap();
        pool.free(blocks[2]).unwrap();
        pool.free(blocks[14]).unwrap();
        // Joins the tail block, leaving blocks[14] in the freelist right
        // next to a CBS block, behind blocks[2] which the CBS refuses.
        pool.free(blocks[15]).unwrap();
        assert_eq!(pool.stats().secondary_free, 0x80);

        let before = pool.free_size();
        let err = pool.free(blocks[14]).unwrap_err();
        assert!(matches!(err, Error::Land(e) if e.is_not_applicable()));
        let err = pool.free(Range::new(blocks[14].base() + 0x20, blocks[15].limit())).unwrap_err();
        assert!(matches!(err, Error::Land(e) if e.is_not_applicable()));
        assert_eq!(pool.free_size(), before);
        pool.check().unwrap();
    }

    #[test]
    fn test_reduce_finds_grains_in_secondary() {
        let config = small_config()
            .with_spare(0.0)
            .with_cbs(CbsConfig::default().with_extend_by(1).with_node_limit(1));
        let mut pool = pool(config);
        let _x = pool.alloc(0x800).unwrap();
        let y = pool.alloc(0x1000).unwrap();
        let _z = pool.alloc(0x800).unwrap();
        let w = pool.alloc(0x2000).unwrap();
        assert_eq!(w, Range::new(0x100_2000, 0x100_4000));

        // A grain's worth of free space, but straddling two grains.
        pool.free(y).unwrap();
        assert_eq!(pool.size(), 0x4000);

        // The CBS has no node left, so this lands in the freelist.
        pool.free(w).unwrap();
        assert_eq!(pool.size(), 0x2000);
        assert_eq!(pool.stats().returned, 0x2000);
        assert_eq!(pool.free_size(), 0x1000);
        pool.check().unwrap();
    }

    #[test]
    fn test_node_limited_primary_uses_secondary() {
        let config = small_config()
            .with_spare(1.0)
            .with_cbs(CbsConfig::default().with_extend_by(1).with_node_limit(2));
        let mut pool = pool(config);

        let ranges_out: Vec<Range> = (0..16).map(|_| pool.alloc(0x40).unwrap()).collect();
        for range in ranges_out.iter().step_by(2) {
            pool.free(*range).unwrap();
        }
        let stats = pool.stats();
        assert!(stats.secondary_free > 0);
        assert_eq!(stats.free, pool.size() - 8 * 0x40);
        pool.check().unwrap();

        for range in ranges_out.iter().skip(1).step_by(2) {
            pool.free(*range).unwrap();
        }
        assert_eq!(pool.free_size(), pool.size());
        let land = pool.free_land().unwrap();
        let mut held = ranges(&land);
        held.sort();
        let total: usize = held.iter().map(Range::size).sum();
        assert_eq!(total, 0x4000);
    }

    #[test]
    fn test_describe_mentions_lands() {
        let mut pool = pool(small_config());
        pool.alloc(0x100).unwrap();
        let text = pool.describe().unwrap();
        assert!(text.starts_with("mvff {"));
        assert!(text.contains("failover {"));
    }

    #[test]
    fn test_shared_pool_across_threads() {
        let shared = SharedPool::new(pool(small_config().with_spare(1.0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let range = shared.alloc(0x40).unwrap();
                        shared.free(range).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.free_size(), shared.size());
        shared.with(|pool| pool.check()).unwrap();
    }
}
