use crate::error::Result;
use crate::fiber::{Callback, Fiber};
use std::sync::Arc;

/// A pool of finished fibers kept for reuse, so callbacks can run without a
/// fresh stack allocation.
///
/// Designed to be owned by a single worker.
pub struct FiberPool {
    pool: Vec<Arc<Fiber>>,
    stack_size: usize,
    capacity: usize,
}

impl FiberPool {
    /// Creates an empty pool. A `stack_size` of zero uses the configured
    /// default at allocation time.
    pub fn new(capacity: usize, stack_size: usize) -> Self {
        FiberPool {
            pool: Vec::with_capacity(capacity),
            stack_size,
            capacity,
        }
    }

    /// Pre-allocates up to `count` idle fibers, stopping at capacity.
    pub fn grow(&mut self, count: usize) -> Result<()> {
        for _ in 0..count.min(self.capacity.saturating_sub(self.pool.len())) {
            self.pool.push(Fiber::new(|| {}, self.stack_size)?);
        }
        Ok(())
    }

    /// Returns a fiber ready to run `callback`, reusing a pooled one if any.
    pub fn get(&mut self, callback: Callback) -> Result<Arc<Fiber>> {
        match self.pool.pop() {
            Some(fiber) => {
                self.recycle(&fiber, callback)?;
                Ok(fiber)
            }
            None => Fiber::with_callback(callback, self.stack_size),
        }
    }

    /// Rebinds a finished fiber to `callback`, keeping its stack.
    ///
    /// Rejects main fibers and fibers that are not `Init`, `Term` or `Except`.
    pub fn recycle(&self, fiber: &Fiber, callback: Callback) -> Result<()> {
        fiber.try_reset(callback)
    }

    /// Takes `fiber` back if it is finished, unshared and there is room.
    ///
    /// Returns whether the fiber was kept.
    pub fn return_fiber(&mut self, fiber: Arc<Fiber>) -> bool {
        if self.pool.len() >= self.capacity
            || fiber.is_main()
            || !fiber.state().is_recyclable()
            || Arc::strong_count(&fiber) != 1
        {
            return false;
        }
        self.pool.push(fiber);
        true
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for FiberPool {
    fn default() -> Self {
        FiberPool::new(16, 0)
    }
}

impl std::fmt::Debug for FiberPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberPool")
            .field("len", &self.pool.len())
            .field("capacity", &self.capacity)
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
