//! Named OS threads with a startup handshake.
//!
//! [`Thread::new`] does not return until the spawned thread has recorded its
//! name and id in thread-local state, so both are valid on the caller side
//! immediately after construction.

use crate::error::{Error, Result};
use crate::log::Logger;
use crate::sync::Semaphore;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

/// Name reported by threads that never set one.
pub const UNKNOWN_THREAD_NAME: &str = "UNKNOWN";

thread_local! {
    static THREAD_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

#[cfg(target_os = "linux")]
fn os_thread_id() -> u64 {
    // SAFETY: gettid has no preconditions and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A named OS thread.
///
/// Dropping a `Thread` without joining it detaches the OS thread.
#[derive(Debug)]
pub struct Thread {
    name: String,
    id: u64,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns `callback` on a new thread called `name`.
    ///
    /// Blocks until the new thread has initialized its thread-local name and
    /// id. An empty name becomes [`UNKNOWN_THREAD_NAME`].
    pub fn new<F>(callback: F, name: &str) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = if name.is_empty() {
            UNKNOWN_THREAD_NAME.to_string()
        } else {
            name.to_string()
        };

        let handshake = Arc::new(Semaphore::new(0));
        let started_id = Arc::new(AtomicU64::new(0));

        let handle = {
            let handshake = handshake.clone();
            let started_id = started_id.clone();
            let thread_name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    Thread::set_current_name(&thread_name);
                    started_id.store(Thread::current_id(), Ordering::Release);
                    handshake.notify();
                    drop(handshake);
                    callback();
                })
                .map_err(|source| {
                    Logger::system().error(format_args!("failed to spawn thread `{name}`: {source}"));
                    Error::ThreadSpawn {
                        name: name.clone(),
                        source,
                    }
                })?
        };

        handshake.wait();

        Ok(Thread {
            id: started_id.load(Ordering::Acquire),
            name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS-level id of the spawned thread.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the thread to finish. Joining twice is a no-op.
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle.join().map_err(|_| {
            Logger::system().error(format_args!("thread `{}` panicked", self.name));
            Error::ThreadJoin {
                name: self.name.clone(),
            }
        })
    }

    pub fn is_joined(&self) -> bool {
        self.handle.is_none()
    }

    /// Name of the calling thread.
    ///
    /// Falls back to the std thread name, then to [`UNKNOWN_THREAD_NAME`].
    pub fn current_name() -> String {
        // Loggers call this during thread teardown, after the slot is gone.
        THREAD_NAME
            .try_with(|name| name.borrow().clone())
            .ok()
            .flatten()
            .unwrap_or_else(|| {
                std::thread::current()
                    .name()
                    .unwrap_or(UNKNOWN_THREAD_NAME)
                    .to_string()
            })
    }

    /// Renames the calling thread as far as this crate is concerned.
    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|current| *current.borrow_mut() = Some(name.to_string()));
    }

    /// OS-level id of the calling thread.
    pub fn current_id() -> u64 {
        THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(os_thread_id());
            }
            id.get()
        })
    }
}
