//! freerange: free-range bookkeeping for manual pool allocators
//!
//! Pools keep their free address space in a *land*, a set of disjoint
//! aligned ranges. This crate provides a coalescing block structure that
//! can run out of bookkeeping nodes, a freelist that cannot, and a failover
//! land that combines the two so a pool never loses track of free memory
//! when its preferred structure is exhausted. A manual free-first-fit pool
//! and a simulated address arena sit on top.

#![warn(missing_docs)]

/// Address ranges and alignment arithmetic
pub mod range;

/// Zone stripes over the address space
pub mod zone;

/// Range-set contract and its implementations
pub mod land;

/// Address space source for pools
pub mod arena;

/// Manual free-first-fit pool
pub mod pool;

/// Randomized workloads against the failover land
#[cfg(test)]
mod failover_stress_tests;

// Re-exports
pub use arena::{AddressArena, ArenaError};
pub use config::{ArenaConfig, CbsConfig, PoolConfig};
pub use error::{Error, Result};
pub use land::{
    Cbs, Failover, FindDelete, Found, Freelist, Land, LandError, LandResult, NodePool, Visit,
};
pub use pool::{MvffPool, PoolStats, SharedPool};
pub use range::{Addr, Range};
pub use zone::ZoneSet;

/// Error types for freerange operations
pub mod error {
    use thiserror::Error;

    use crate::arena::ArenaError;
    use crate::land::LandError;

    /// Errors that can occur in pool and arena operations
    #[derive(Debug, Clone, PartialEq, Error)]
    pub enum Error {
        /// A land refused or failed an operation
        #[error(transparent)]
        Land(#[from] LandError),

        /// The arena could not supply or take back address space
        #[error(transparent)]
        Arena(#[from] ArenaError),

        /// A request for zero bytes
        #[error("cannot allocate zero bytes")]
        ZeroSize,

        /// Configuration error
        #[error("configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// Build a [`Error::Config`] from a message
        pub fn config(msg: impl Into<String>) -> Self {
            Error::Config(msg.into())
        }

        /// Returns true if the error means the address space ran out.
        pub fn is_exhausted(&self) -> bool {
            matches!(self, Error::Arena(err) if err.is_exhausted())
        }
    }

    /// Result type for freerange operations
    pub type Result<T> = std::result::Result<T, Error>;
}

/// Configuration options for lands, pools and arenas
pub mod config {
    use crate::error::{Error, Result};
    use crate::range::{is_aligned, Addr};

    /// Configuration for a coalescing block structure
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CbsConfig {
        /// Alignment of every range the land holds
        pub alignment: usize,
        /// Bytes one bookkeeping node takes when built from stolen memory
        pub node_size: usize,
        /// Nodes added each time the node pool grows
        pub extend_by: usize,
        /// Most nodes the pool may grow to, unbounded if `None`
        pub node_limit: Option<usize>,
        /// Whether the node pool may grow at all
        pub extend_self: bool,
    }

    impl Default for CbsConfig {
        fn default() -> Self {
            Self {
                alignment: 8,
                node_size: 32,
                extend_by: 32,
                node_limit: None,
                extend_self: true,
            }
        }
    }

    impl CbsConfig {
        /// Set the range alignment
        pub fn with_alignment(mut self, alignment: usize) -> Self {
            self.alignment = alignment;
            self
        }

        /// Set the bytes a stolen node takes
        pub fn with_node_size(mut self, node_size: usize) -> Self {
            self.node_size = node_size;
            self
        }

        /// Set the node pool growth step
        pub fn with_extend_by(mut self, extend_by: usize) -> Self {
            self.extend_by = extend_by;
            self
        }

        /// Cap node pool growth at `node_limit` nodes
        pub fn with_node_limit(mut self, node_limit: usize) -> Self {
            self.node_limit = Some(node_limit);
            self
        }

        /// Allow or forbid node pool growth
        pub fn with_extend_self(mut self, extend_self: bool) -> Self {
            self.extend_self = extend_self;
            self
        }

        /// Check that the configuration makes sense
        pub fn validate(&self) -> Result<()> {
            if !self.alignment.is_power_of_two() {
                return Err(Error::config("cbs alignment must be a power of two"));
            }
            if self.node_size == 0 {
                return Err(Error::config("cbs node size must be non-zero"));
            }
            if self.extend_by == 0 {
                return Err(Error::config("cbs must extend by at least one node"));
            }
            Ok(())
        }
    }

    /// Configuration for a manual free-first-fit pool
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct PoolConfig {
        /// Alignment of every allocation
        pub alignment: usize,
        /// Least address space taken from the arena per extension
        pub extend_by: usize,
        /// Fraction of the pool's span it keeps free before returning
        /// memory to the arena
        pub spare: f64,
        /// Allocate from the high end of free blocks
        pub slot_high: bool,
        /// Take extensions from the high end of the arena
        pub arena_high: bool,
        /// Search by address rather than for the largest block
        pub first_fit: bool,
        /// Node pool settings for the primary free land
        pub cbs: CbsConfig,
    }

    impl Default for PoolConfig {
        fn default() -> Self {
            Self {
                alignment: 8,
                extend_by: 64 * 1024, // 64KB
                spare: 0.75,
                slot_high: false,
                arena_high: false,
                first_fit: true,
                cbs: CbsConfig::default(),
            }
        }
    }

    impl PoolConfig {
        /// Set the allocation alignment
        pub fn with_alignment(mut self, alignment: usize) -> Self {
            self.alignment = alignment;
            self
        }

        /// Set the least bytes taken per extension
        pub fn with_extend_by(mut self, extend_by: usize) -> Self {
            self.extend_by = extend_by;
            self
        }

        /// Set the free fraction kept before returning memory
        pub fn with_spare(mut self, spare: f64) -> Self {
            self.spare = spare;
            self
        }

        /// Allocate from the high or low end of free blocks
        pub fn with_slot_high(mut self, slot_high: bool) -> Self {
            self.slot_high = slot_high;
            self
        }

        /// Take extensions from the high or low end of the arena
        pub fn with_arena_high(mut self, arena_high: bool) -> Self {
            self.arena_high = arena_high;
            self
        }

        /// Choose address-ordered or largest-block search
        pub fn with_first_fit(mut self, first_fit: bool) -> Self {
            self.first_fit = first_fit;
            self
        }

        /// Set the primary free land's node pool settings
        pub fn with_cbs(mut self, cbs: CbsConfig) -> Self {
            self.cbs = cbs;
            self
        }

        /// Check that the configuration makes sense
        pub fn validate(&self) -> Result<()> {
            if !self.alignment.is_power_of_two() {
                return Err(Error::config("pool alignment must be a power of two"));
            }
            if self.extend_by == 0 {
                return Err(Error::config("pool extend size must be non-zero"));
            }
            if !(0.0..=1.0).contains(&self.spare) {
                return Err(Error::config(format!(
                    "pool spare fraction {} is outside [0, 1]",
                    self.spare
                )));
            }
            self.cbs.with_alignment(self.alignment).validate()
        }
    }

    /// Configuration for a simulated address arena
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaConfig {
        /// Lowest address the arena hands out
        pub base: Addr,
        /// Bytes of address space reserved
        pub reserve: usize,
        /// Unit of every span the arena hands out
        pub grain: usize,
        /// Log2 of the zone stripe width
        pub zone_shift: u32,
        /// Most bytes that may be handed out at once, unbounded if `None`
        pub commit_limit: Option<usize>,
    }

    impl Default for ArenaConfig {
        fn default() -> Self {
            Self {
                base: 0x1000_0000,
                reserve: 256 * 1024 * 1024, // 256MB
                grain: 4096,
                zone_shift: 20,
                commit_limit: None,
            }
        }
    }

    impl ArenaConfig {
        /// Set the lowest address handed out
        pub fn with_base(mut self, base: Addr) -> Self {
            self.base = base;
            self
        }

        /// Set the reserved window size
        pub fn with_reserve(mut self, reserve: usize) -> Self {
            self.reserve = reserve;
            self
        }

        /// Set the span unit
        pub fn with_grain(mut self, grain: usize) -> Self {
            self.grain = grain;
            self
        }

        /// Set the log2 zone stripe width
        pub fn with_zone_shift(mut self, zone_shift: u32) -> Self {
            self.zone_shift = zone_shift;
            self
        }

        /// Bound the bytes handed out at once
        pub fn with_commit_limit(mut self, commit_limit: usize) -> Self {
            self.commit_limit = Some(commit_limit);
            self
        }

        /// Check that the configuration makes sense
        pub fn validate(&self) -> Result<()> {
            if !self.grain.is_power_of_two() {
                return Err(Error::config("arena grain must be a power of two"));
            }
            if self.reserve == 0 || !is_aligned(self.reserve, self.grain) {
                return Err(Error::config("arena reserve must be a non-zero number of grains"));
            }
            if !is_aligned(self.base, self.grain) {
                return Err(Error::config("arena base must be grain aligned"));
            }
            if self.base.checked_add(self.reserve).is_none() {
                return Err(Error::config("arena reserve overflows the address space"));
            }
            if (self.zone_shift as usize) >= usize::BITS as usize
                || (1usize << self.zone_shift) < self.grain
            {
                return Err(Error::config("arena zone stripe must be at least one grain"));
            }
            Ok(())
        }
    }
}
