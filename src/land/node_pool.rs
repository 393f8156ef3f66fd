//! Bookkeeping node pool for the CBS
//!
//! Every block a [`Cbs`](super::Cbs) holds costs one node. Nodes come from a
//! pool that grows in batches of `extend_by`; growth stops at `node_limit` or
//! entirely when the pool may not extend itself. Memory stolen from the
//! ranges being inserted or deleted can be donated to the pool instead.

use thiserror::Error;

use crate::config::CbsConfig;

/// Errors that can occur when taking a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NodePoolError {
    /// Growing would exceed the configured node limit.
    #[error("node pool exhausted at {capacity} nodes")]
    Exhausted {
        /// Nodes the pool held when growth was refused
        capacity: usize,
    },

    /// The pool is configured not to extend itself.
    #[error("node pool may not extend itself")]
    NoExtend,
}

/// Pool of CBS bookkeeping nodes
#[derive(Debug, Clone)]
pub struct NodePool {
    /// Nodes available in total
    capacity: usize,
    /// Nodes handed out
    in_use: usize,
    /// Nodes added per growth step
    extend_by: usize,
    /// Upper bound on `capacity` reached by growth
    limit: Option<usize>,
    /// Whether the pool may grow at all
    extend_self: bool,
    /// Bytes one node occupies when built from stolen memory
    node_size: usize,
    /// Bytes donated from stolen ranges
    stolen: usize,
}

impl NodePool {
    /// Create an empty pool that grows the way `config` allows.
    pub fn new(config: &CbsConfig) -> Self {
        Self {
            capacity: 0,
            in_use: 0,
            extend_by: config.extend_by.max(1),
            limit: config.node_limit,
            extend_self: config.extend_self,
            node_size: config.node_size,
            stolen: 0,
        }
    }

    /// Take one node, growing the pool if none is free.
    pub fn alloc(&mut self) -> Result<(), NodePoolError> {
        if self.in_use == self.capacity {
            self.extend()?;
        }
        self.in_use += 1;
        Ok(())
    }

    /// Return one node to the pool.
    pub fn free(&mut self) {
        debug_assert!(self.in_use > 0, "node pool underflow");
        self.in_use -= 1;
    }

    fn extend(&mut self) -> Result<(), NodePoolError> {
        if !self.extend_self {
            return Err(NodePoolError::NoExtend);
        }
        let target = self.capacity + self.extend_by;
        let target = self.limit.map_or(target, |limit| target.min(limit));
        if target <= self.capacity {
            return Err(NodePoolError::Exhausted {
                capacity: self.capacity,
            });
        }
        tracing::trace!(from = self.capacity, to = target, "extending node pool");
        self.capacity = target;
        Ok(())
    }

    /// Add nodes built from `bytes` of stolen memory. Returns how many nodes
    /// were added.
    pub fn donate(&mut self, bytes: usize) -> usize {
        let nodes = bytes / self.node_size;
        self.capacity += nodes;
        self.stolen += bytes;
        nodes
    }

    /// Drop every spare node and stop growth, so the next operation that
    /// needs a node fails.
    pub fn starve(&mut self) {
        self.capacity = self.in_use;
        self.limit = Some(self.in_use);
    }

    /// Whether a node can be taken without growing
    pub fn has_free(&self) -> bool {
        self.in_use < self.capacity
    }

    /// Nodes available in total
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Nodes handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes one node costs when built from stolen memory
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Bytes donated from stolen ranges
    pub fn stolen(&self) -> usize {
        self.stolen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_in_batches() {
        let mut pool = NodePool::new(&CbsConfig::default().with_extend_by(4));
        for _ in 0..5 {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.in_use(), 5);
        pool.free();
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn test_limit_caps_growth() {
        let mut pool = NodePool::new(&CbsConfig::default().with_extend_by(4).with_node_limit(6));
        for _ in 0..6 {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.alloc(), Err(NodePoolError::Exhausted { capacity: 6 }));
    }

    #[test]
    fn test_starve_and_no_extend() {
        let mut pool = NodePool::new(&CbsConfig::default().with_extend_by(2));
        pool.alloc().unwrap();
        pool.starve();
        assert_eq!(pool.capacity(), 1);
        assert!(pool.alloc().is_err());

        let mut fixed = NodePool::new(&CbsConfig::default().with_extend_self(false));
        assert_eq!(fixed.alloc(), Err(NodePoolError::NoExtend));
    }

    #[test]
    fn test_donation_adds_capacity() {
        let mut pool = NodePool::new(&CbsConfig::default().with_extend_self(false));
        let node_size = pool.node_size();
        assert_eq!(pool.donate(node_size * 2), 2);
        pool.alloc().unwrap();
        pool.alloc().unwrap();
        assert!(!pool.has_free());
        assert_eq!(pool.stolen(), node_size * 2);
    }
}
