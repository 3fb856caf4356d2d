//! Synchronization primitives used by the runtime.
//!
//! Locks are `parking_lot`'s: acquisition returns a guard and the lock is
//! released when the guard leaves scope, on every path including unwinding.

use parking_lot::Condvar;
use std::time::{Duration, Instant};

pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A counting semaphore.
///
/// [`wait`](Semaphore::wait) blocks until the count is positive and then
/// decrements it; [`notify`](Semaphore::notify) increments it and wakes one
/// waiter.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Like [`wait`](Semaphore::wait), giving up after `timeout`.
    ///
    /// Returns `true` if a unit was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Units currently available.
    pub fn available(&self) -> usize {
        *self.count.lock()
    }
}
