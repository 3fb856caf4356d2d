//! # fibersched - Stackful Fibers on an N:M Scheduler
//!
//! A cooperative coroutine ("fiber") runtime with a scheduler that multiplexes
//! many fibers over a fixed pool of OS worker threads.
//!
//! ## Architecture
//!
//! Fibers are multiplexed onto worker threads; each worker runs fibers one at a
//! time and only switches at explicit yield points. Key components include:
//!
//! - **Fibers**: stackful execution contexts with an explicit lifecycle
//!   (`Init -> Exec -> {Ready, Hold, Term, Except}`)
//! - **Thread context**: per-thread record of the running fiber and the
//!   thread's implicit main fiber
//! - **Scheduler**: FIFO task queue with optional worker affinity, a pool of
//!   named worker threads and a pluggable wake/idle strategy
//! - **Threads and primitives**: named OS threads with a startup handshake,
//!   scoped locks and a counting semaphore
//!
//! Tunables live in a hierarchical configuration store that can be fed from
//! YAML, and faults are reported through named loggers on top of `tracing`.
//!
//! ## Example
//!
//! ```no_run
//! use fibersched::{Fiber, Scheduler};
//!
//! let scheduler = Scheduler::new(4, false, "demo").unwrap();
//! scheduler.start().unwrap();
//!
//! scheduler
//!     .schedule_fn(|| {
//!         println!("before yield");
//!         Fiber::yield_ready();
//!         println!("after yield");
//!     })
//!     .unwrap();
//!
//! scheduler.stop().unwrap();
//! ```

/// Logs a fatal invariant violation through the system logger and aborts.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::abort_with(format_args!($($arg)*))
    };
}

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod fiber_pool;
pub mod log;
pub mod park;
pub mod scheduler;
pub mod sync;
pub mod thread;

pub use config::{Config, ConfigVar, ConfigVarBase};
pub use context::yield_now;
pub use error::{Error, Result};
pub use fiber::{Callback, Fiber, FiberOutcome, FiberState};
pub use fiber_pool::FiberPool;
pub use log::{AppenderDefine, LogFormat, LogLevel, Logger};
pub use park::{CondvarPark, Park, SpinPark};
pub use scheduler::{Affinity, Handle, Scheduler, SchedulerConfig, SchedulerState, Task};
pub use sync::Semaphore;
pub use thread::Thread;
