//! Wake and idle strategies for scheduler workers.
//!
//! A worker that finds no eligible task calls [`Park::idle`]; whoever
//! enqueues work into an empty queue calls [`Park::tickle`].

use crate::config;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// How idle workers wait and how they are woken.
pub trait Park: Send + Sync {
    /// Signals that new work may be available. Defaults to doing nothing.
    fn tickle(&self) {}

    /// Wakes every idle worker; used on shutdown.
    fn tickle_all(&self) {
        self.tickle();
    }

    /// Called by a worker with nothing to run. Must return eventually even
    /// without a tickle, since shutdown is checked between calls.
    fn idle(&self) {
        std::thread::yield_now();
    }
}

/// Spins with exponential backoff, then yields the OS thread. Never sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpinPark;

impl Park for SpinPark {
    fn idle(&self) {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            backoff.snooze();
        }
    }
}

/// Sleeps on a condition variable until tickled or until a timeout passes.
///
/// A tickle that arrives while no worker is waiting is remembered, so the next
/// worker to go idle returns immediately.
#[derive(Debug)]
pub struct CondvarPark {
    pending: Mutex<bool>,
    cond: Condvar,
    timeout: Duration,
}

impl CondvarPark {
    pub fn new(timeout: Duration) -> Self {
        CondvarPark {
            pending: Mutex::new(false),
            cond: Condvar::new(),
            timeout,
        }
    }

    /// Uses the `scheduler.idle_timeout_ms` tunable.
    pub fn from_config() -> Self {
        CondvarPark::new(config::idle_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for CondvarPark {
    fn default() -> Self {
        CondvarPark::from_config()
    }
}

impl Park for CondvarPark {
    fn tickle(&self) {
        *self.pending.lock() = true;
        self.cond.notify_one();
    }

    fn tickle_all(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }

    fn idle(&self) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, self.timeout);
        }
        *pending = false;
    }
}
