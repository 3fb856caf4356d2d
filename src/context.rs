//! Per-thread execution context.
//!
//! Every thread that touches the runtime gets a context holding the fiber it
//! is currently running and its main fiber. The main fiber is created lazily
//! on first access and lives until the thread exits.

use crate::fiber::Fiber;
use std::cell::RefCell;
use std::sync::Arc;

struct ThreadContext {
    current: RefCell<Option<Arc<Fiber>>>,
    main: RefCell<Option<Arc<Fiber>>>,
}

thread_local! {
    static THREAD_CONTEXT: ThreadContext = const {
        ThreadContext {
            current: RefCell::new(None),
            main: RefCell::new(None),
        }
    };
}

/// The calling thread's running fiber, materializing its main fiber on first
/// use.
pub fn current_fiber() -> Arc<Fiber> {
    THREAD_CONTEXT.with(|ctx| {
        if let Some(current) = ctx.current.borrow().as_ref() {
            return current.clone();
        }
        let main = Fiber::new_main();
        *ctx.main.borrow_mut() = Some(main.clone());
        *ctx.current.borrow_mut() = Some(main.clone());
        main
    })
}

/// The calling thread's running fiber, without creating a main fiber.
pub fn try_current_fiber() -> Option<Arc<Fiber>> {
    THREAD_CONTEXT
        .try_with(|ctx| ctx.current.borrow().clone())
        .ok()
        .flatten()
}

/// The calling thread's main fiber, creating it if needed.
pub fn main_fiber() -> Arc<Fiber> {
    let current = current_fiber();
    THREAD_CONTEXT.with(|ctx| ctx.main.borrow().clone()).unwrap_or(current)
}

/// Id of the running fiber, 0 when the thread has none (or is its main fiber).
pub fn current_fiber_id() -> u64 {
    try_current_fiber().map_or(0, |fiber| fiber.id())
}

/// Makes `fiber` current and returns the fiber that was running before.
pub(crate) fn enter(fiber: Arc<Fiber>) -> Arc<Fiber> {
    let previous = current_fiber();
    THREAD_CONTEXT.with(|ctx| *ctx.current.borrow_mut() = Some(fiber));
    previous
}

/// Restores the fiber returned by [`enter`].
pub(crate) fn leave(previous: Arc<Fiber>) {
    let finished = THREAD_CONTEXT.with(|ctx| ctx.current.borrow_mut().replace(previous));
    drop(finished);
}

/// Yields execution to allow other work to run.
///
/// Inside a spawned fiber this suspends it as `Ready`; on a plain thread it
/// yields the OS thread.
pub fn yield_now() {
    match try_current_fiber() {
        Some(fiber) if !fiber.is_main() => {
            drop(fiber);
            Fiber::yield_ready();
        }
        _ => std::thread::yield_now(),
    }
}
