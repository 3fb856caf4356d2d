//! Fiber management and execution context.
//!
//! A fiber is a stackful coroutine. Spawned fibers own a `corosensei` stack
//! and run a trampoline that executes one callback per activation; the
//! implicit main fiber of a thread borrows the thread's own stack and never
//! holds a callback.
//!
//! Execution ownership is tracked with a `running` flag: it is claimed with a
//! compare-and-swap before switching onto the fiber's stack and released only
//! after the fiber has switched back, so a fiber can never execute on two
//! threads at once. The fiber's published state follows the same rule: a
//! yield only becomes visible as `Ready`/`Hold` once the switch has completed.

use crate::config;
use crate::context;
use crate::error::{Error, Result};
use crate::log::Logger;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// The unit of work a fiber runs.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

type FiberYielder = Yielder<(), FiberState>;
type FiberCoroutine = Coroutine<(), FiberState, (), DefaultStack>;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Lifecycle state of a fiber.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FiberState {
    /// Created or reset, callback not started.
    Init,
    /// Suspended; whoever holds the handle decides when it runs again.
    Hold,
    /// Currently executing.
    Exec,
    /// Callback returned normally.
    Term,
    /// Suspended and asking to be rescheduled.
    Ready,
    /// Callback panicked.
    Except,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }

    /// `Term` or `Except`.
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// States in which a spawned fiber may be reset or destroyed.
    pub fn is_recyclable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    /// States from which [`Fiber::resume`] may switch in.
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberState::Init | FiberState::Ready | FiberState::Hold)
    }
}

/// How the last callback run by a fiber ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FiberOutcome {
    Completed,
    Faulted(String),
}

/// A stackful coroutine.
///
/// Handles are shared as `Arc<Fiber>`; the fiber is destroyed when the last
/// handle goes away, which requires a recyclable state for spawned fibers.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    running: AtomicBool,
    /// Set only for a thread's implicit main fiber.
    main: bool,
    stack_size: usize,
    /// `None` for a thread's main fiber.
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    callback: Mutex<Option<Callback>>,
    outcome: Mutex<Option<FiberOutcome>>,
    /// Set by the trampoline; only read while this fiber is executing.
    yielder: Cell<*const FiberYielder>,
}

// SAFETY: the coroutine and yielder are only touched by the thread that won
// the `running` flag, which serializes every access. Callbacks are `Send`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Spawns a fiber that will run `callback` on its own stack.
    ///
    /// A `stack_size` of zero uses the `fiber.stack_size` tunable.
    pub fn new<F>(callback: F, stack_size: usize) -> Result<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::with_callback(Box::new(callback), stack_size)
    }

    /// Like [`Fiber::new`] for an already boxed callback.
    pub fn with_callback(callback: Callback, stack_size: usize) -> Result<Arc<Fiber>> {
        let stack_size = if stack_size == 0 {
            config::fiber_stack_size()
        } else {
            stack_size
        };
        let stack = DefaultStack::new(stack_size).map_err(|source| {
            Logger::system().error(format_args!("fiber stack allocation of {stack_size} bytes failed: {source}"));
            Error::StackAllocation {
                size: stack_size,
                source,
            }
        })?;
        let coroutine = Coroutine::with_stack(stack, trampoline);

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber_id = id, stack_size, "fiber created");

        Ok(Arc::new(Fiber {
            id,
            state: AtomicU8::new(FiberState::Init as u8),
            running: AtomicBool::new(false),
            main: false,
            stack_size,
            coroutine: UnsafeCell::new(Some(coroutine)),
            callback: Mutex::new(Some(callback)),
            outcome: Mutex::new(None),
            yielder: Cell::new(std::ptr::null()),
        }))
    }

    /// Creates the main fiber for the calling thread. Id 0, no stack, `Exec`.
    pub(crate) fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("main fiber created");
        Arc::new(Fiber {
            id: 0,
            state: AtomicU8::new(FiberState::Exec as u8),
            running: AtomicBool::new(true),
            main: true,
            stack_size: 0,
            coroutine: UnsafeCell::new(None),
            callback: Mutex::new(None),
            outcome: Mutex::new(None),
            yielder: Cell::new(std::ptr::null()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Size of the owned stack, zero for a main fiber.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Whether this is a thread's implicit main fiber.
    pub fn is_main(&self) -> bool {
        self.main
    }

    /// Whether the fiber's stack is currently active on some thread.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Outcome of the most recent callback, if one has finished.
    pub fn outcome(&self) -> Option<FiberOutcome> {
        self.outcome.lock().clone()
    }

    /// Switches into this fiber and runs it until it yields or finishes.
    ///
    /// Returns the state the fiber left in. The calling fiber is marked
    /// `Hold` while this one runs and restored to `Exec` afterwards.
    ///
    /// Resuming a main fiber, a fiber that is already running or one that
    /// has finished is a fatal error.
    pub fn resume(self: &Arc<Self>) -> FiberState {
        if self.is_main() {
            fatal!("attempt to resume main fiber of thread {}", crate::thread::Thread::current_name());
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            fatal!("fiber {} resumed while already running", self.id);
        }
        let state = self.state();
        if !state.is_resumable() {
            fatal!("fiber {} resumed in state {:?}", self.id, state);
        }
        self.set_state(FiberState::Exec);

        let caller = context::enter(self.clone());
        caller.set_state(FiberState::Hold);

        // SAFETY: winning `running` grants exclusive access to the coroutine.
        let coroutine = unsafe { &mut *self.coroutine.get() };
        let result = match coroutine.as_mut() {
            Some(coroutine) => coroutine.resume(()),
            None => fatal!("fiber {} has no execution context", self.id),
        };

        caller.set_state(FiberState::Exec);
        context::leave(caller);

        let state = match result {
            CoroutineResult::Yield(state) => state,
            CoroutineResult::Return(()) => fatal!("fiber {} trampoline returned", self.id),
        };
        self.set_state(state);
        self.running.store(false, Ordering::Release);
        state
    }

    /// Switches the running fiber back to its resumer, leaving it `Hold`.
    ///
    /// Must be called on the currently executing fiber.
    pub fn switch_out(&self) {
        let current = context::current_fiber();
        if !std::ptr::eq(Arc::as_ptr(&current), self) {
            fatal!("fiber {} switched out while fiber {} is running", self.id, current.id);
        }
        drop(current);
        self.suspend(FiberState::Hold);
    }

    /// Gives a finished fiber a new callback, keeping its stack.
    ///
    /// Resetting a main fiber or one that is not `Init`/`Term`/`Except` is a
    /// fatal error. See [`FiberPool::recycle`](crate::FiberPool::recycle) for
    /// the checked variant.
    pub fn reset<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.try_reset(Box::new(callback)) {
            fatal!("{}", err);
        }
    }

    pub(crate) fn try_reset(&self, callback: Callback) -> Result<()> {
        let state = self.state();
        if self.is_main() || self.is_running() || !state.is_recyclable() {
            return Err(Error::NotRecyclable { id: self.id, state });
        }
        *self.callback.lock() = Some(callback);
        *self.outcome.lock() = None;
        self.set_state(FiberState::Init);
        Ok(())
    }

    /// The calling thread's running fiber, creating its main fiber if needed.
    pub fn current() -> Arc<Fiber> {
        context::current_fiber()
    }

    /// Id of the calling thread's running fiber, 0 if there is none.
    pub fn current_id() -> u64 {
        context::current_fiber_id()
    }

    /// Suspends the running fiber and asks to be rescheduled.
    ///
    /// On a main fiber this yields the OS thread instead.
    pub fn yield_ready() {
        Fiber::yield_current(FiberState::Ready);
    }

    /// Suspends the running fiber until someone resumes it explicitly.
    ///
    /// On a main fiber this yields the OS thread instead.
    pub fn yield_hold() {
        Fiber::yield_current(FiberState::Hold);
    }

    /// Number of live fibers in the process, main fibers included.
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    fn yield_current(state: FiberState) {
        let current = context::current_fiber();
        if current.is_main() {
            std::thread::yield_now();
            return;
        }
        let fiber: *const Fiber = Arc::as_ptr(&current);
        drop(current);
        // SAFETY: the thread context keeps the running fiber alive until it
        // switches out, and our own handle is gone so a suspended fiber holds
        // no reference to itself.
        unsafe { (*fiber).suspend(state) };
    }

    fn suspend(&self, state: FiberState) {
        let yielder = self.yielder.get();
        if yielder.is_null() {
            fatal!("fiber {} yielded outside its trampoline", self.id);
        }
        // SAFETY: the yielder lives on this fiber's stack for the whole
        // lifetime of the coroutine and we are executing on that stack.
        unsafe { (*yielder).suspend(state) };
    }
}

/// Entry point of every spawned fiber.
///
/// Runs one callback per activation and reports how it ended by suspending
/// with `Term` or `Except`; a reset then resumes it at the top of the loop.
/// It never returns.
fn trampoline(yielder: &FiberYielder, _input: ()) {
    loop {
        let state = main_entry(yielder);
        yielder.suspend(state);
    }
}

fn main_entry(yielder: &FiberYielder) -> FiberState {
    let (id, callback) = {
        let fiber = context::current_fiber();
        fiber.yielder.set(yielder as *const FiberYielder);
        let callback = fiber.callback.lock().take();
        (fiber.id, callback)
    };
    let Some(callback) = callback else {
        fatal!("fiber {} started without a callback", id);
    };

    let result = catch_unwind(AssertUnwindSafe(callback));

    let fiber = context::current_fiber();
    match result {
        Ok(()) => {
            *fiber.outcome.lock() = Some(FiberOutcome::Completed);
            FiberState::Term
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            Logger::system().error(format_args!(
                "fiber {} panicked: {}\n{}",
                fiber.id,
                message,
                std::backtrace::Backtrace::capture()
            ));
            *fiber.outcome.lock() = Some(FiberOutcome::Faulted(message));
            FiberState::Except
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.is_main() {
            if self.callback.get_mut().is_some() {
                fatal!("main fiber holds a callback");
            }
        } else if !state.is_recyclable() || *self.running.get_mut() {
            fatal!("fiber {} dropped in state {:?}", self.id, state);
        }
        tracing::trace!(fiber_id = self.id, ?state, "fiber destroyed");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            FiberState::Init,
            FiberState::Hold,
            FiberState::Exec,
            FiberState::Term,
            FiberState::Ready,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_state_classes() {
        assert!(FiberState::Term.is_terminal());
        assert!(!FiberState::Init.is_terminal());
        assert!(FiberState::Init.is_recyclable());
        assert!(!FiberState::Hold.is_recyclable());
        assert!(FiberState::Hold.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
    }

    #[test]
    fn test_new_fiber_is_init() {
        let fiber = Fiber::new(|| {}, 64 * 1024).unwrap();
        assert_eq!(fiber.state(), FiberState::Init);
        assert_eq!(fiber.stack_size(), 64 * 1024);
        assert!(fiber.has_callback());
        assert!(!fiber.is_main());
        assert!(fiber.id() > 0);
        assert_eq!(fiber.outcome(), None);
    }

    #[test]
    fn test_zero_stack_size_uses_config() {
        let fiber = Fiber::new(|| {}, 0).unwrap();
        assert_eq!(fiber.stack_size(), config::fiber_stack_size());
    }

    #[test]
    fn test_main_flag_is_independent_of_stack_size() {
        let main = Fiber::new_main();
        assert!(main.is_main());
        assert_eq!(main.stack_size(), 0);
        assert_eq!(main.id(), 0);
        drop(main);

        let spawned = Fiber::new(|| {}, 64 * 1024).unwrap();
        assert!(!spawned.is_main());
        assert_eq!(spawned.resume(), FiberState::Term);
    }

    #[test]
    fn test_ids_increase() {
        let a = Fiber::new(|| {}, 64 * 1024).unwrap();
        let b = Fiber::new(|| {}, 64 * 1024).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
